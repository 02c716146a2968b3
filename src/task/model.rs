//! Task data model: kinds, statuses, ledger rows, billing info.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of task kinds. Each kind maps to exactly one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    ImageCharacter,
    ImageLocation,
    ImagePanel,
    VideoShot,
    VoiceLine,
    TextGeneration,
    TextAnalysis,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageCharacter => "IMAGE_CHARACTER",
            Self::ImageLocation => "IMAGE_LOCATION",
            Self::ImagePanel => "IMAGE_PANEL",
            Self::VideoShot => "VIDEO_SHOT",
            Self::VoiceLine => "VOICE_LINE",
            Self::TextGeneration => "TEXT_GENERATION",
            Self::TextAnalysis => "TEXT_ANALYSIS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IMAGE_CHARACTER" => Some(Self::ImageCharacter),
            "IMAGE_LOCATION" => Some(Self::ImageLocation),
            "IMAGE_PANEL" => Some(Self::ImagePanel),
            "VIDEO_SHOT" => Some(Self::VideoShot),
            "VOICE_LINE" => Some(Self::VoiceLine),
            "TEXT_GENERATION" => Some(Self::TextGeneration),
            "TEXT_ANALYSIS" => Some(Self::TextAnalysis),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a ledger row.
///
/// Terminal rows (`Completed` / `Failed`) are never re-transitioned; every
/// status update in the store is guarded by the expected source statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller intends the task's output to do to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskIntent {
    /// Produce entirely new output.
    Generate,
    /// Transform or refresh existing output.
    Process,
}

impl TaskIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Process => "process",
        }
    }

    /// Coerce an optional payload value, defaulting by task kind: image,
    /// video and voice kinds generate media; text kinds process it.
    pub fn coerce(value: Option<&Value>, kind: TaskKind) -> Self {
        if let Some(Value::String(s)) = value {
            match s.as_str() {
                "generate" => return Self::Generate,
                "process" => return Self::Process,
                _ => {}
            }
        }
        match kind {
            TaskKind::TextGeneration | TaskKind::TextAnalysis => Self::Process,
            _ => Self::Generate,
        }
    }
}

/// A persisted task ledger row. The single source of truth for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// 0..=100.
    pub progress: u8,
    /// Opaque JSON; `stage`, `stageLabel`, `ui.hasOutputAtStart` and
    /// `ui.intent` are the only fields the core reads.
    pub payload: Value,
    pub result: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub target_type: String,
    pub target_id: String,
    /// At most one concurrently active task per key; released on terminal.
    pub dedupe_key: Option<String>,
    /// Opaque charge reference consumed by the billing ledger.
    pub billing_info: Option<Value>,
    pub user_id: String,
    pub project_id: String,
    pub episode_id: Option<String>,
    pub priority: i32,
    pub attempt: u32,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub enqueue_attempts: u32,
    pub last_enqueue_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A fresh queued row for submission.
    pub fn new_queued(params: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: params.kind,
            status: TaskStatus::Queued,
            progress: 0,
            payload: params.payload,
            result: None,
            error_code: None,
            error_message: None,
            target_type: params.target_type,
            target_id: params.target_id,
            dedupe_key: params.dedupe_key,
            billing_info: params.billing_info,
            user_id: params.user_id,
            project_id: params.project_id,
            episode_id: params.episode_id,
            priority: params.priority,
            attempt: 0,
            enqueued_at: None,
            enqueue_attempts: 0,
            last_enqueue_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
        }
    }
}

/// Fields the caller supplies when creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub target_type: String,
    pub target_id: String,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub billing_info: Option<Value>,
    pub user_id: String,
    pub project_id: String,
    pub episode_id: Option<String>,
    pub priority: i32,
}

// ── Payload field extraction ────────────────────────────────────────

pub fn as_object(value: &Value) -> Option<&serde_json::Map<String, Value>> {
    value.as_object()
}

pub fn as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// Fields the resolver surfaces from a task row's payload. All optional and
/// independently defaulted so foreign payload shapes never fail to read.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadStateFields {
    pub stage: Option<String>,
    pub stage_label: Option<String>,
    pub has_output_at_start: Option<bool>,
    pub intent: TaskIntent,
}

pub fn extract_state_fields(kind: TaskKind, payload: &Value) -> PayloadStateFields {
    let obj = as_object(payload);
    let ui = obj.and_then(|o| o.get("ui")).and_then(Value::as_object);
    let intent_raw = ui
        .and_then(|u| u.get("intent"))
        .or_else(|| obj.and_then(|o| o.get("intent")));
    PayloadStateFields {
        stage: as_non_empty_string(obj.and_then(|o| o.get("stage"))),
        stage_label: as_non_empty_string(obj.and_then(|o| o.get("stageLabel"))),
        has_output_at_start: ui.and_then(|u| u.get("hasOutputAtStart")).and_then(Value::as_bool),
        intent: TaskIntent::coerce(intent_raw, kind),
    }
}

/// Clamp a raw progress number into 0..=100.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

// ── Billing info ────────────────────────────────────────────────────

/// Parsed charge reference. Read leniently: malformed or absent info means
/// there is nothing to roll back.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBillingInfo {
    pub billable: bool,
    pub freeze_id: Option<String>,
    pub mode_snapshot: Option<String>,
    pub status: Option<String>,
}

impl TaskBillingInfo {
    pub fn parse(raw: Option<&Value>) -> Option<Self> {
        let obj = raw?.as_object()?;
        let billable = obj.get("billable")?.as_bool()?;
        Some(Self {
            billable,
            freeze_id: as_non_empty_string(obj.get("freezeId")),
            mode_snapshot: as_non_empty_string(obj.get("modeSnapshot")),
            status: as_non_empty_string(obj.get("status")),
        })
    }

    /// Whether a rollback is actually owed for this charge.
    pub fn needs_rollback(&self) -> bool {
        if !self.billable || self.freeze_id.is_none() {
            return false;
        }
        if matches!(self.mode_snapshot.as_deref(), Some("OFF") | Some("SHADOW")) {
            return false;
        }
        !matches!(self.status.as_deref(), Some("settled") | Some("rolled_back"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Queued.is_active());
        assert!(TaskStatus::Processing.is_active());
    }

    #[test]
    fn kind_round_trips() {
        for kind in [
            TaskKind::ImageCharacter,
            TaskKind::VideoShot,
            TaskKind::VoiceLine,
            TaskKind::TextGeneration,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TaskKind::parse("NOT_A_KIND"), None);
    }

    #[test]
    fn extracts_recognized_payload_fields() {
        let payload = json!({
            "stage": "llm_streaming",
            "stageLabel": "Generating",
            "ui": { "hasOutputAtStart": true, "intent": "generate" },
            "custom": { "anything": 1 },
        });
        let fields = extract_state_fields(TaskKind::TextGeneration, &payload);
        assert_eq!(fields.stage.as_deref(), Some("llm_streaming"));
        assert_eq!(fields.stage_label.as_deref(), Some("Generating"));
        assert_eq!(fields.has_output_at_start, Some(true));
        assert_eq!(fields.intent, TaskIntent::Generate);
    }

    #[test]
    fn foreign_payload_shapes_default_cleanly() {
        for payload in [json!(null), json!("legacy"), json!([1, 2]), json!({"stage": "  "})] {
            let fields = extract_state_fields(TaskKind::ImagePanel, &payload);
            assert_eq!(fields.stage, None);
            assert_eq!(fields.has_output_at_start, None);
            assert_eq!(fields.intent, TaskIntent::Generate);
        }
    }

    #[test]
    fn billing_info_rollback_policy() {
        let live = TaskBillingInfo::parse(Some(&json!({
            "billable": true, "freezeId": "f1", "modeSnapshot": "ENFORCE", "status": "frozen",
        })))
        .unwrap();
        assert!(live.needs_rollback());

        let shadow = TaskBillingInfo::parse(Some(&json!({
            "billable": true, "freezeId": "f1", "modeSnapshot": "SHADOW",
        })))
        .unwrap();
        assert!(!shadow.needs_rollback());

        let settled = TaskBillingInfo::parse(Some(&json!({
            "billable": true, "freezeId": "f1", "status": "settled",
        })))
        .unwrap();
        assert!(!settled.needs_rollback());

        assert_eq!(TaskBillingInfo::parse(Some(&json!({"freezeId": "f1"}))), None);
        assert_eq!(TaskBillingInfo::parse(None), None);
    }
}
