//! Wire shapes for lifecycle and stream events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::model::{TaskKind, TaskRecord, TaskStatus};

/// Reconcile-originated terminal events carry this source marker so replay
/// consumers can recognize them.
pub const SOURCE_DB_RECONCILE: &str = "db_reconcile";

/// Lifecycle transition carried by a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleType {
    Created,
    Processing,
    Completed,
    Failed,
    Dismissed,
}

impl LifecycleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Payload of a lifecycle event. Everything beyond the type is optional so
/// producers only carry what they know.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecyclePayload {
    pub lifecycle_type: LifecycleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    /// Who produced the event; `db_reconcile` marks watchdog-originated
    /// terminal events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_reason: Option<String>,
    // Step metadata for multi-step runs. Producers that model their work as
    // steps carry these; everyone else leaves them out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_total: Option<u32>,
    /// Producer says the current step just finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    /// Final text output of the step, carried on completion events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl LifecyclePayload {
    pub fn new(lifecycle_type: LifecycleType) -> Self {
        Self {
            lifecycle_type,
            stage: None,
            stage_label: None,
            progress: None,
            message: None,
            error_code: None,
            cancelled: None,
            source: None,
            reconcile_reason: None,
            step_id: None,
            step_attempt: None,
            step_title: None,
            step_index: None,
            step_total: None,
            done: None,
            text: None,
        }
    }

    pub fn created() -> Self {
        Self::new(LifecycleType::Created)
    }

    pub fn processing(progress: u8, stage: Option<String>, stage_label: Option<String>) -> Self {
        Self { progress: Some(progress), stage, stage_label, ..Self::new(LifecycleType::Processing) }
    }

    pub fn completed() -> Self {
        Self { progress: Some(100), ..Self::new(LifecycleType::Completed) }
    }

    pub fn failed(code: &str, message: &str) -> Self {
        Self {
            error_code: Some(code.to_string()),
            message: Some(message.to_string()),
            ..Self::new(LifecycleType::Failed)
        }
    }

    pub fn with_cancelled(mut self) -> Self {
        self.cancelled = Some(true);
        self
    }

    pub fn from_reconcile(mut self, reason: &str) -> Self {
        self.source = Some(SOURCE_DB_RECONCILE.to_string());
        self.reconcile_reason = Some(reason.to_string());
        self
    }
}

/// Inner stream body: one delta on one output lane of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBody {
    /// Content kind, e.g. `text` or `reasoning`.
    pub kind: String,
    /// Output lane within the step, used for per-lane accumulation.
    pub lane: String,
    /// Monotonic per-lane sequence number.
    pub seq: u64,
    pub delta: String,
}

/// Payload of a stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPayload {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_attempt: Option<u32>,
    pub stream: StreamBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Stream(StreamPayload),
    Lifecycle(LifecyclePayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lifecycle,
    Stream,
}

/// One event on the wire, scoped to its task and target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: Uuid,
    pub task_type: TaskKind,
    pub target_type: String,
    pub target_id: String,
    pub project_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    pub payload: EventPayload,
}

impl TaskEvent {
    pub fn lifecycle(task: &TaskRecord, payload: LifecyclePayload) -> Self {
        Self {
            kind: EventKind::Lifecycle,
            task_id: task.id,
            task_type: task.kind,
            target_type: task.target_type.clone(),
            target_id: task.target_id.clone(),
            project_id: task.project_id.clone(),
            user_id: task.user_id.clone(),
            episode_id: task.episode_id.clone(),
            payload: EventPayload::Lifecycle(payload),
        }
    }

    pub fn stream(task: &TaskRecord, payload: StreamPayload) -> Self {
        Self {
            kind: EventKind::Stream,
            task_id: task.id,
            task_type: task.kind,
            target_type: task.target_type.clone(),
            target_id: task.target_id.clone(),
            project_id: task.project_id.clone(),
            user_id: task.user_id.clone(),
            episode_id: task.episode_id.clone(),
            payload: EventPayload::Stream(payload),
        }
    }

    pub fn lifecycle_payload(&self) -> Option<&LifecyclePayload> {
        match &self.payload {
            EventPayload::Lifecycle(p) => Some(p),
            EventPayload::Stream(_) => None,
        }
    }

    pub fn stream_payload(&self) -> Option<&StreamPayload> {
        match &self.payload {
            EventPayload::Stream(p) => Some(p),
            EventPayload::Lifecycle(_) => None,
        }
    }

    /// The `event_type` string persisted alongside this event.
    pub fn persisted_type(&self) -> &'static str {
        match &self.payload {
            EventPayload::Stream(_) => "stream",
            EventPayload::Lifecycle(p) => p.lifecycle_type.as_str(),
        }
    }

    /// Whether this event settles the task: a terminal lifecycle event from
    /// any source, worker- or reconcile-originated.
    pub fn is_terminal(&self) -> bool {
        self.lifecycle_payload().is_some_and(|p| p.lifecycle_type.is_terminal())
    }

    /// The lifecycle type a terminal ledger status should appear as.
    pub fn terminal_type_for(status: TaskStatus) -> Option<LifecycleType> {
        match status {
            TaskStatus::Completed => Some(LifecycleType::Completed),
            TaskStatus::Failed => Some(LifecycleType::Failed),
            _ => None,
        }
    }
}
