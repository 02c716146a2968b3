//! Fallback poll-until-terminal helper for callers without a streaming
//! channel. Polls a task snapshot at a fixed interval and settles when the
//! task reaches a terminal state, the status becomes unreadable, or the
//! deadline passes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::PollError;
use crate::task::error_message::resolve_task_error_summary;

/// Where snapshots come from. Returns the raw JSON body of a task snapshot
/// so the poller works over any transport.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, task_id: Uuid) -> Result<String, PollError>;
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self { interval: Duration::from_millis(1500), timeout: Duration::from_secs(1800) }
    }
}

/// Poll until the task completes. Resolves with the snapshot's `result`
/// field on completion; rejects with a normalized failure, an unrecognized
/// status, a malformed snapshot, or on timeout. A parse failure is an
/// explicit error, never a silent retry.
pub async fn poll_until_terminal(
    source: &dyn SnapshotSource,
    task_id: Uuid,
    options: PollOptions,
) -> Result<Option<Value>, PollError> {
    let deadline = tokio::time::Instant::now() + options.timeout;
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout { task_id });
        }
        ticker.tick().await;

        // Bound the fetch itself so a hung source cannot outlive the deadline.
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let body = tokio::time::timeout(remaining, source.fetch_snapshot(task_id))
            .await
            .map_err(|_| PollError::Timeout { task_id })??;
        let snapshot: Value = serde_json::from_str(&body).map_err(|e| {
            PollError::MalformedSnapshot { task_id, reason: e.to_string() }
        })?;

        let status = snapshot
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| PollError::MalformedSnapshot {
                task_id,
                reason: "snapshot has no status field".to_string(),
            })?;

        match status {
            "completed" => {
                let result = snapshot.get("result").filter(|v| !v.is_null()).cloned();
                return Ok(result);
            }
            "failed" => {
                let summary =
                    resolve_task_error_summary(&snapshot_error_payload(&snapshot), "Task failed");
                return Err(PollError::TaskFailed {
                    task_id,
                    code: summary.code.unwrap_or_else(|| "INTERNAL_ERROR".to_string()),
                    message: summary.message,
                    cancelled: summary.cancelled,
                });
            }
            "queued" | "processing" => {
                debug!(task_id = %task_id, status, "Task still in flight");
            }
            other => {
                return Err(PollError::UnrecognizedStatus {
                    task_id,
                    status: other.to_string(),
                });
            }
        }
    }
}

/// Shape the snapshot's error fields the way the shared normalizer expects.
fn snapshot_error_payload(snapshot: &Value) -> Value {
    let mut payload = serde_json::Map::new();
    if let Some(code) = snapshot.get("errorCode").filter(|v| !v.is_null()) {
        payload.insert("errorCode".to_string(), code.clone());
    }
    if let Some(message) = snapshot.get("errorMessage").filter(|v| !v.is_null()) {
        payload.insert("errorMessage".to_string(), message.clone());
    }
    if let Some(error) = snapshot.get("error").filter(|v| !v.is_null()) {
        payload.insert("error".to_string(), error.clone());
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedSource {
        bodies: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(bodies: Vec<Value>) -> Self {
            Self {
                bodies: Mutex::new(
                    bodies.into_iter().rev().map(|v| v.to_string()).collect(),
                ),
            }
        }

        fn raw(bodies: Vec<&str>) -> Self {
            Self {
                bodies: Mutex::new(bodies.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self, task_id: Uuid) -> Result<String, PollError> {
            self.bodies
                .lock()
                .unwrap()
                .pop()
                .ok_or(PollError::FetchFailed { task_id, reason: "script exhausted".into() })
        }
    }

    fn fast_options() -> PollOptions {
        PollOptions { interval: Duration::from_millis(5), timeout: Duration::from_secs(5) }
    }

    #[tokio::test]
    async fn resolves_with_result_on_completion() {
        let source = ScriptedSource::new(vec![
            json!({"status": "queued"}),
            json!({"status": "processing", "progress": 50}),
            json!({"status": "completed", "result": {"imageUrl": "u"}}),
        ]);
        let result = poll_until_terminal(&source, Uuid::new_v4(), fast_options()).await.unwrap();
        assert_eq!(result, Some(json!({"imageUrl": "u"})));
    }

    #[tokio::test]
    async fn failure_is_normalized_and_cancellation_flagged() {
        let source = ScriptedSource::new(vec![json!({
            "status": "failed",
            "errorCode": "TASK_CANCELLED",
            "errorMessage": "Task cancelled by user",
        })]);
        let err = poll_until_terminal(&source, Uuid::new_v4(), fast_options()).await.unwrap_err();
        let PollError::TaskFailed { code, cancelled, .. } = err else {
            panic!("expected TaskFailed, got {err}");
        };
        assert_eq!(code, "TASK_CANCELLED");
        assert!(cancelled);
    }

    #[tokio::test]
    async fn generic_failure_is_not_cancelled() {
        let source = ScriptedSource::new(vec![json!({
            "status": "failed",
            "errorCode": "INTERNAL_ERROR",
            "errorMessage": "model exploded",
        })]);
        let err = poll_until_terminal(&source, Uuid::new_v4(), fast_options()).await.unwrap_err();
        let PollError::TaskFailed { message, cancelled, .. } = err else {
            panic!("expected TaskFailed, got {err}");
        };
        assert_eq!(message, "model exploded");
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn malformed_snapshot_is_an_explicit_error() {
        let source = ScriptedSource::raw(vec!["{not json"]);
        let err = poll_until_terminal(&source, Uuid::new_v4(), fast_options()).await.unwrap_err();
        assert!(matches!(err, PollError::MalformedSnapshot { .. }));
    }

    #[tokio::test]
    async fn unrecognized_status_rejects() {
        let source = ScriptedSource::new(vec![json!({"status": "paused"})]);
        let err = poll_until_terminal(&source, Uuid::new_v4(), fast_options()).await.unwrap_err();
        assert!(matches!(err, PollError::UnrecognizedStatus { .. }));
    }

    #[tokio::test]
    async fn times_out_when_task_never_settles() {
        struct Forever;

        #[async_trait]
        impl SnapshotSource for Forever {
            async fn fetch_snapshot(&self, _task_id: Uuid) -> Result<String, PollError> {
                Ok(json!({"status": "processing"}).to_string())
            }
        }

        let options =
            PollOptions { interval: Duration::from_millis(5), timeout: Duration::from_millis(40) };
        let err = poll_until_terminal(&Forever, Uuid::new_v4(), options).await.unwrap_err();
        assert!(matches!(err, PollError::Timeout { .. }));
    }

    #[tokio::test]
    async fn times_out_when_fetch_hangs() {
        struct Hung;

        #[async_trait]
        impl SnapshotSource for Hung {
            async fn fetch_snapshot(&self, _task_id: Uuid) -> Result<String, PollError> {
                std::future::pending().await
            }
        }

        let options =
            PollOptions { interval: Duration::from_millis(5), timeout: Duration::from_millis(40) };
        let err = poll_until_terminal(&Hung, Uuid::new_v4(), options).await.unwrap_err();
        assert!(matches!(err, PollError::Timeout { .. }));
    }
}
