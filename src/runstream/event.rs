//! Mapping from wire task events to run-stream events.
//!
//! The run view is driven by a small closed event vocabulary; this module
//! translates lifecycle and stream wire events into it. The same mapping is
//! used live and during replay, so a reconnecting consumer cannot tell the
//! difference.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::events::model::{EventPayload, LifecyclePayload, LifecycleType, TaskEvent};
use crate::task::error_message::resolve_task_error_summary;

/// Which per-step buffer a chunk accumulates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkLane {
    Text,
    Reasoning,
}

/// One event in the run-stream vocabulary the reducer consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStart {
        message: Option<String>,
    },
    StepStart {
        step_id: String,
        step_attempt: Option<u32>,
        title: Option<String>,
        index: Option<u32>,
        total: Option<u32>,
        message: Option<String>,
    },
    StepChunk {
        step_id: String,
        step_attempt: Option<u32>,
        lane: ChunkLane,
        seq: Option<u64>,
        delta: String,
    },
    StepComplete {
        step_id: String,
        step_attempt: Option<u32>,
        title: Option<String>,
        index: Option<u32>,
        total: Option<u32>,
        text: Option<String>,
        message: Option<String>,
    },
    StepError {
        step_id: String,
        step_attempt: Option<u32>,
        message: String,
    },
    RunError {
        message: String,
    },
    RunComplete {
        payload: Option<Value>,
        message: Option<String>,
    },
    RunDismissed,
}

/// Stages a producer uses to say "this step's generation finished".
fn stage_looks_completed(stage: Option<&str>) -> bool {
    matches!(
        stage,
        Some("llm_completed")
            | Some("worker_llm_completed")
            | Some("worker_llm_complete")
            | Some("llm_proxy_persist")
            | Some("completed")
    )
}

fn stage_looks_failed(stage: Option<&str>) -> bool {
    matches!(stage, Some("llm_error") | Some("worker_llm_error") | Some("error"))
}

/// Split a raw step id carrying a legacy `#retry-N` suffix into its logical
/// id and the attempt the suffix implies. The suffix is a compatibility
/// shim; an explicit `stepAttempt` field always wins over it.
pub fn split_retry_suffix(raw: &str) -> (String, Option<u32>) {
    static RETRY_SUFFIX: OnceLock<Regex> = OnceLock::new();
    let re = RETRY_SUFFIX.get_or_init(|| {
        // Unwrap is fine: the pattern is a literal.
        Regex::new(r"^(.*)#retry-(\d+)$").unwrap()
    });
    if let Some(caps) = re.captures(raw) {
        let logical = caps[1].to_string();
        if let Ok(n) = caps[2].parse::<u32>() {
            // "#retry-1" is the first retry, i.e. attempt 2.
            return (logical, Some(n.saturating_add(1)));
        }
    }
    (raw.to_string(), None)
}

fn error_message_of(payload: &LifecyclePayload) -> String {
    let raw = serde_json::json!({
        "code": payload.error_code,
        "errorMessage": payload.message,
        "stage": payload.stage,
        "cancelled": payload.cancelled,
    });
    resolve_task_error_summary(&raw, "Task failed").message
}

fn step_start_of(payload: &LifecyclePayload, step_id: &str) -> RunEvent {
    RunEvent::StepStart {
        step_id: step_id.to_string(),
        step_attempt: payload.step_attempt,
        title: payload.step_title.clone(),
        index: payload.step_index,
        total: payload.step_total,
        message: payload.message.clone(),
    }
}

/// Map one wire event to zero or more run events, in application order.
pub fn map_task_event(event: &TaskEvent) -> Vec<RunEvent> {
    match &event.payload {
        EventPayload::Stream(stream) => {
            if stream.stream.delta.is_empty() {
                return Vec::new();
            }
            let lane = if stream.stream.lane == "reasoning" || stream.stream.kind == "reasoning"
            {
                ChunkLane::Reasoning
            } else {
                ChunkLane::Text
            };
            vec![RunEvent::StepChunk {
                step_id: stream.step_id.clone(),
                step_attempt: stream.step_attempt,
                lane,
                seq: Some(stream.stream.seq),
                delta: stream.stream.delta.clone(),
            }]
        }
        EventPayload::Lifecycle(payload) => map_lifecycle(payload),
    }
}

fn map_lifecycle(payload: &LifecyclePayload) -> Vec<RunEvent> {
    let step_id = payload.step_id.as_deref();
    let stage = payload.stage.as_deref();
    match payload.lifecycle_type {
        LifecycleType::Created => {
            vec![RunEvent::RunStart { message: payload.message.clone() }]
        }
        LifecycleType::Processing => {
            let Some(step_id) = step_id else { return Vec::new() };
            let mut events = vec![step_start_of(payload, step_id)];
            if payload.done == Some(true) || stage_looks_completed(stage) {
                events.push(RunEvent::StepComplete {
                    step_id: step_id.to_string(),
                    step_attempt: payload.step_attempt,
                    title: payload.step_title.clone(),
                    index: payload.step_index,
                    total: payload.step_total,
                    text: payload.text.clone(),
                    message: payload.message.clone(),
                });
            } else if stage_looks_failed(stage) {
                events.push(RunEvent::StepError {
                    step_id: step_id.to_string(),
                    step_attempt: payload.step_attempt,
                    message: error_message_of(payload),
                });
            }
            events
        }
        LifecycleType::Completed => {
            let mut events = Vec::new();
            if let Some(step_id) = step_id {
                events.push(RunEvent::StepComplete {
                    step_id: step_id.to_string(),
                    step_attempt: payload.step_attempt,
                    title: payload.step_title.clone(),
                    index: payload.step_index,
                    total: payload.step_total,
                    text: payload.text.clone(),
                    message: payload.message.clone(),
                });
            }
            events.push(RunEvent::RunComplete { payload: None, message: payload.message.clone() });
            events
        }
        LifecycleType::Failed => {
            let message = error_message_of(payload);
            let mut events = Vec::new();
            if let Some(step_id) = step_id {
                events.push(RunEvent::StepError {
                    step_id: step_id.to_string(),
                    step_attempt: payload.step_attempt,
                    message: message.clone(),
                });
            }
            events.push(RunEvent::RunError { message });
            events
        }
        LifecycleType::Dismissed => vec![RunEvent::RunDismissed],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::{StreamBody, StreamPayload};
    use crate::task::model::{NewTask, TaskKind, TaskRecord};
    use serde_json::json;

    fn task() -> TaskRecord {
        TaskRecord::new_queued(NewTask {
            kind: TaskKind::TextGeneration,
            target_type: "Storyboard".into(),
            target_id: "B1".into(),
            payload: json!({}),
            dedupe_key: None,
            billing_info: None,
            user_id: "u1".into(),
            project_id: "p1".into(),
            episode_id: None,
            priority: 0,
        })
    }

    #[test]
    fn retry_suffix_parsing() {
        assert_eq!(split_retry_suffix("outline"), ("outline".into(), None));
        assert_eq!(split_retry_suffix("outline#retry-1"), ("outline".into(), Some(2)));
        assert_eq!(split_retry_suffix("outline#retry-3"), ("outline".into(), Some(4)));
        // A hash without the retry marker is part of the id.
        assert_eq!(split_retry_suffix("a#b"), ("a#b".into(), None));
    }

    #[test]
    fn empty_delta_maps_to_nothing() {
        let event = TaskEvent::stream(
            &task(),
            StreamPayload {
                step_id: "s1".into(),
                step_attempt: None,
                stream: StreamBody { kind: "text".into(), lane: "text".into(), seq: 1, delta: String::new() },
            },
        );
        assert!(map_task_event(&event).is_empty());
    }

    #[test]
    fn reasoning_kind_routes_to_reasoning_lane() {
        let event = TaskEvent::stream(
            &task(),
            StreamPayload {
                step_id: "s1".into(),
                step_attempt: Some(2),
                stream: StreamBody { kind: "reasoning".into(), lane: "text".into(), seq: 4, delta: "hm".into() },
            },
        );
        match &map_task_event(&event)[0] {
            RunEvent::StepChunk { lane, step_attempt, seq, .. } => {
                assert_eq!(*lane, ChunkLane::Reasoning);
                assert_eq!(*step_attempt, Some(2));
                assert_eq!(*seq, Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn processing_with_completed_stage_emits_start_then_complete() {
        let mut payload = LifecyclePayload::processing(80, Some("llm_completed".into()), None);
        payload.step_id = Some("draft".into());
        payload.text = Some("final text".into());
        let events = map_lifecycle(&payload);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunEvent::StepStart { .. }));
        assert!(matches!(events[1], RunEvent::StepComplete { ref text, .. } if text.as_deref() == Some("final text")));
    }

    #[test]
    fn processing_without_step_id_is_ignored() {
        let payload = LifecyclePayload::processing(10, None, None);
        assert!(map_lifecycle(&payload).is_empty());
    }

    #[test]
    fn failed_lifecycle_emits_step_error_then_run_error() {
        let mut payload = LifecyclePayload::failed("INTERNAL_ERROR", "boom");
        payload.step_id = Some("draft".into());
        let events = map_lifecycle(&payload);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunEvent::StepError { ref message, .. } if message == "boom"));
        assert!(matches!(events[1], RunEvent::RunError { ref message } if message == "boom"));
    }

    #[test]
    fn dismissed_maps_to_run_dismissed() {
        let payload = LifecyclePayload::new(LifecycleType::Dismissed);
        assert_eq!(map_lifecycle(&payload), vec![RunEvent::RunDismissed]);
    }
}
