//! Error types for genlane.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Poll error: {0}")]
    Poll(#[from] PollError),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Dedupe key collision: {0}")]
    DedupeCollision(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Lane queue errors.
///
/// `LivenessCheckFailed` is deliberately distinct from "job missing": a
/// failed inspection must never be coerced into an absent job, or the
/// watchdog would fail tasks that are still running.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Lane {lane} unavailable: {reason}")]
    Unavailable { lane: String, reason: String },

    #[error("Enqueue failed on lane {lane}: {reason}")]
    EnqueueFailed { lane: String, reason: String },

    #[error("Liveness check failed on lane {lane}: {reason}")]
    LivenessCheckFailed { lane: String, reason: String },

    #[error("No lane registered for task kind {kind}")]
    NoLaneForKind { kind: String },
}

/// Billing ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("Rollback failed for task {task_id}: {reason}")]
    RollbackFailed { task_id: Uuid, reason: String },

    #[error("Billing ledger unavailable: {0}")]
    Unavailable(String),
}

/// Task submission errors (always surfaced synchronously).
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Task {task_id} failed to enqueue: {reason}")]
    EnqueueFailed { task_id: Uuid, reason: String },

    #[error("Billing compensation failed for task {task_id}: {reason}")]
    BillingCompensationFailed { task_id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Fallback poller errors.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Task {task_id} failed: [{code}] {message}")]
    TaskFailed {
        task_id: Uuid,
        code: String,
        message: String,
        cancelled: bool,
    },

    #[error("Task {task_id} reported unrecognized status {status}")]
    UnrecognizedStatus { task_id: Uuid, status: String },

    #[error("Snapshot for task {task_id} is not valid JSON: {reason}")]
    MalformedSnapshot { task_id: Uuid, reason: String },

    #[error("Snapshot fetch failed for task {task_id}: {reason}")]
    FetchFailed { task_id: Uuid, reason: String },

    #[error("Timed out waiting for task {task_id} to reach a terminal state")]
    Timeout { task_id: Uuid },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
