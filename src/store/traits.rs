//! `TaskStore` — single async interface for the task ledger and event log.
//!
//! Every status transition is a single precondition-guarded row update; the
//! guard methods return `false` when the row was not in one of the expected
//! source statuses, and never touch terminal rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::task::model::{TaskKind, TaskRecord};

/// A persisted task event (lifecycle or stream) for replay.
#[derive(Debug, Clone)]
pub struct EventRow {
    /// Monotonic log id, orders replay.
    pub id: i64,
    pub task_id: Uuid,
    pub project_id: String,
    pub user_id: String,
    /// Lifecycle type string (`created`, `processing`, ...) or `stream`.
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// An event to append to the log.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub task_id: Uuid,
    pub project_id: String,
    pub user_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Backend-agnostic store covering the task ledger and the event log.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Ledger writes ───────────────────────────────────────────────

    /// Insert a new queued row. Fails on dedupe-key collision.
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError>;

    /// queued|processing → processing; bumps attempt, sets started/heartbeat.
    async fn mark_processing(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// processing only: update progress and optionally replace the payload.
    async fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        payload: Option<&Value>,
    ) -> Result<bool, DatabaseError>;

    /// processing only: refresh the heartbeat timestamp.
    async fn touch_heartbeat(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// processing → completed; progress forced to 100, heartbeat cleared,
    /// dedupe key released.
    async fn mark_completed(&self, id: Uuid, result: Option<&Value>)
    -> Result<bool, DatabaseError>;

    /// queued|processing → failed; heartbeat cleared, dedupe key released.
    /// Code/message are truncated to 80/2000 chars.
    async fn mark_failed(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, DatabaseError>;

    /// Record a failed enqueue attempt on a queued row.
    async fn record_enqueue_failure(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError>;

    /// Mark a queued row as successfully handed to its lane.
    async fn mark_enqueued(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Replace the stored billing info.
    async fn update_billing_info(
        &self,
        id: Uuid,
        billing_info: Option<&Value>,
    ) -> Result<(), DatabaseError>;

    /// Clear the dedupe key on a terminal row so a new task can claim it.
    async fn release_dedupe_key(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Ledger reads ────────────────────────────────────────────────

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Most recently created row holding this dedupe key, if any.
    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<TaskRecord>, DatabaseError>;

    /// All queued/processing rows, oldest-updated first, up to `limit`.
    async fn list_active_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Processing rows whose heartbeat (or start, or last update when both
    /// are null) predates `before`.
    async fn list_stale_processing(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// All rows for the given (target_type, target_id) pairs, optionally
    /// filtered by kind. Unsorted; the resolver sorts per target group.
    async fn list_tasks_for_targets(
        &self,
        project_id: &str,
        user_id: &str,
        pairs: &[(String, String)],
        kinds: Option<&[TaskKind]>,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    // ── Event log ───────────────────────────────────────────────────

    /// Append an event; returns the persisted row with its log id.
    async fn insert_event(&self, event: &NewEvent) -> Result<EventRow, DatabaseError>;

    /// Full persisted history for one task, oldest first, up to `limit`
    /// most recent rows.
    async fn list_task_events(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<EventRow>, DatabaseError>;

    /// Project-scoped events with log id greater than `after_id`, ascending.
    async fn list_events_after(
        &self,
        project_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<EventRow>, DatabaseError>;
}
