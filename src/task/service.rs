//! Task lifecycle service: guarded transitions, dedupe enforcement, billing
//! compensation, and the lane worker executor.
//!
//! Every status change goes through a precondition-guarded store update; a
//! denied transition is logged with the expected and actual status, never
//! silently retried against a terminal row.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::billing::{BillingLedger, RollbackOutcome, billing_info_rolled_back, rollback_for_task};
use crate::error::{DatabaseError, Error, QueueError};
use crate::events::model::{LifecyclePayload, StreamPayload};
use crate::events::ProgressPublisher;
use crate::queue::{Job, JobExecutor, LivenessVerdict, ProgressReporter, QueueRouter, TaskHandler};
use crate::store::TaskStore;
use crate::task::model::{
    NewTask, TaskBillingInfo, TaskKind, TaskRecord, TaskStatus, extract_state_fields,
};

pub const ORPHAN_MESSAGE: &str = "Queue job lost, replaced by new task";
pub const CANCELLED_MESSAGE: &str = "Task cancelled by user";

/// How a billing compensation attempt went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStatus {
    /// Nothing was owed.
    Skipped,
    RolledBack,
    /// A rollback was owed and the attempt failed.
    Failed(String),
}

impl RollbackStatus {
    pub fn outcome(&self) -> RollbackOutcome {
        match self {
            Self::Skipped => RollbackOutcome::skipped(),
            Self::RolledBack => RollbackOutcome { attempted: true, rolled_back: true },
            Self::Failed(_) => RollbackOutcome { attempted: true, rolled_back: false },
        }
    }
}

/// Pick the error code/message a failure transition should carry, given how
/// the accompanying billing compensation went. A failed compensation
/// escalates the code so the row is visibly in need of manual repair.
pub fn resolve_compensation_failure(
    rollback: &RollbackStatus,
    fallback_code: &str,
    fallback_message: &str,
) -> (String, String) {
    match rollback {
        RollbackStatus::Failed(_) => (
            "BILLING_COMPENSATION_FAILED".to_string(),
            format!("{fallback_message}; billing rollback failed"),
        ),
        _ => (fallback_code.to_string(), fallback_message.to_string()),
    }
}

#[derive(Debug)]
pub struct CreateOutcome {
    pub task: TaskRecord,
    pub deduped: bool,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    router: Arc<QueueRouter>,
    billing: Arc<dyn BillingLedger>,
    publisher: Arc<ProgressPublisher>,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        router: Arc<QueueRouter>,
        billing: Arc<dyn BillingLedger>,
        publisher: Arc<ProgressPublisher>,
    ) -> Self {
        Self { store, router, billing, publisher }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<QueueRouter> {
        &self.router
    }

    pub fn publisher(&self) -> &Arc<ProgressPublisher> {
        &self.publisher
    }

    pub fn billing(&self) -> &Arc<dyn BillingLedger> {
        &self.billing
    }

    // ── Creation and dedupe ─────────────────────────────────────────

    /// Create a queued ledger row, enforcing the dedupe key.
    ///
    /// An active holder of the key whose queue job is verifiably alive wins:
    /// the existing task is returned as deduped. An active holder whose job
    /// is verifiably gone is an orphan: its billing is rolled back, it is
    /// failed with a reserved code, its key is released, and a fresh task is
    /// created. An inconclusive liveness check propagates as an error; it
    /// must never be read as "job missing".
    pub async fn create_task(&self, input: NewTask) -> Result<CreateOutcome, Error> {
        if let Some(deduped) = self.resolve_dedupe_holder(input.dedupe_key.as_deref()).await? {
            return Ok(CreateOutcome { task: deduped, deduped: true });
        }

        let task = TaskRecord::new_queued(input);
        match self.store.insert_task(&task).await {
            Ok(()) => Ok(CreateOutcome { task, deduped: false }),
            Err(DatabaseError::DedupeCollision(_)) => {
                // A concurrent submit claimed the key between our check and
                // the insert. Resolve the new holder once and try again.
                if let Some(deduped) =
                    self.resolve_dedupe_holder(task.dedupe_key.as_deref()).await?
                {
                    return Ok(CreateOutcome { task: deduped, deduped: true });
                }
                let retry = TaskRecord { id: Uuid::new_v4(), ..task };
                self.store.insert_task(&retry).await.map_err(Error::from)?;
                Ok(CreateOutcome { task: retry, deduped: false })
            }
            Err(e) => Err(Error::Database(e)),
        }
    }

    /// Resolve an existing holder of the dedupe key. Returns the holder when
    /// its queue job is verifiably alive; clears the way (orphan fail or
    /// key release) and returns None otherwise.
    async fn resolve_dedupe_holder(
        &self,
        dedupe_key: Option<&str>,
    ) -> Result<Option<TaskRecord>, Error> {
        let Some(key) = dedupe_key else { return Ok(None) };
        let Some(existing) = self.store.find_by_dedupe_key(key).await.map_err(Error::from)? else {
            return Ok(None);
        };

        if !existing.status.is_active() {
            // Terminal holder: free the key for the new task.
            self.store.release_dedupe_key(existing.id).await.map_err(Error::from)?;
            return Ok(None);
        }

        match self.router.job_verdict(existing.id).await {
            LivenessVerdict::Alive { lane, state } => {
                debug!(task_id = %existing.id, %lane, ?state, "Dedupe hit on live task");
                Ok(Some(existing))
            }
            LivenessVerdict::Missing => {
                info!(task_id = %existing.id, "Dedupe holder lost its queue job, replacing");
                let rollback = self.try_rollback(&existing).await;
                let (code, message) =
                    resolve_compensation_failure(&rollback, "RECONCILE_ORPHAN", ORPHAN_MESSAGE);
                self.fail_with_denied_log(existing.id, &code, &message).await?;
                Ok(None)
            }
            LivenessVerdict::Inconclusive { mut errors } => {
                error!(
                    task_id = %existing.id,
                    errors = errors.len(),
                    "Liveness check inconclusive during dedupe, refusing to replace"
                );
                let cause = errors.pop().unwrap_or(QueueError::LivenessCheckFailed {
                    lane: "all".to_string(),
                    reason: "no lane answered".to_string(),
                });
                Err(Error::Queue(cause))
            }
        }
    }

    // ── Guarded transitions ─────────────────────────────────────────

    pub async fn try_mark_processing(&self, id: Uuid) -> Result<bool, Error> {
        let applied = self.store.mark_processing(id).await.map_err(Error::from)?;
        if !applied {
            self.log_denied(id, "queued|processing").await;
        }
        Ok(applied)
    }

    /// Update progress and publish a processing lifecycle event.
    pub async fn report_progress(
        &self,
        task: &TaskRecord,
        progress: u8,
        payload: Option<Value>,
    ) -> Result<bool, Error> {
        let applied =
            self.store.update_progress(task.id, progress, payload.as_ref()).await.map_err(Error::from)?;
        if !applied {
            self.log_denied(task.id, "processing").await;
            return Ok(false);
        }
        self.store.touch_heartbeat(task.id).await.map_err(Error::from)?;

        let effective = payload.as_ref().unwrap_or(&task.payload);
        let fields = extract_state_fields(task.kind, effective);
        self.publisher
            .publish_lifecycle(
                task,
                LifecyclePayload::processing(progress, fields.stage, fields.stage_label),
                true,
            )
            .await
            .map_err(Error::from)?;
        Ok(true)
    }

    /// Complete the task, settle its billing hold, publish the terminal event.
    pub async fn complete_task(
        &self,
        task: &TaskRecord,
        result: Option<Value>,
    ) -> Result<bool, Error> {
        let applied =
            self.store.mark_completed(task.id, result.as_ref()).await.map_err(Error::from)?;
        if !applied {
            self.log_denied(task.id, "processing").await;
            return Ok(false);
        }
        self.settle_billing(task).await;
        self.publisher
            .publish_lifecycle(task, LifecyclePayload::completed(), true)
            .await
            .map_err(Error::from)?;
        info!(task_id = %task.id, kind = %task.kind, "Task completed");
        Ok(true)
    }

    /// Fail the task with billing compensation and a terminal event.
    pub async fn fail_task(
        &self,
        task: &TaskRecord,
        code: &str,
        message: &str,
        cancelled: bool,
        persist_event: bool,
    ) -> Result<bool, Error> {
        let rollback = self.try_rollback(task).await;
        let (code, message) = resolve_compensation_failure(&rollback, code, message);

        let applied = self.fail_with_denied_log(task.id, &code, &message).await?;
        if !applied {
            return Ok(false);
        }

        let mut payload = LifecyclePayload::failed(&code, &message);
        if cancelled {
            payload = payload.with_cancelled();
        }
        self.publisher.publish_lifecycle(task, payload, persist_event).await.map_err(Error::from)?;
        warn!(task_id = %task.id, code, "Task failed");
        Ok(true)
    }

    async fn fail_with_denied_log(
        &self,
        id: Uuid,
        code: &str,
        message: &str,
    ) -> Result<bool, Error> {
        let applied = self.store.mark_failed(id, code, message).await.map_err(Error::from)?;
        if !applied {
            self.log_denied(id, "queued|processing").await;
            // A terminal row that still holds its dedupe key lost a race;
            // free the key so new submissions are not blocked forever.
            if self.store.release_dedupe_key(id).await.unwrap_or(false) {
                info!(task_id = %id, "Released dedupe key on terminal task after transition race");
            }
        }
        Ok(applied)
    }

    async fn log_denied(&self, id: Uuid, expected: &str) {
        match self.store.get_task(id).await {
            Ok(Some(row)) => {
                warn!(
                    task_id = %id,
                    expected,
                    current = %row.status,
                    "Transition denied due to status mismatch"
                );
            }
            Ok(None) => {
                warn!(task_id = %id, expected, "Transition denied: task not found");
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Transition denied and snapshot read failed");
            }
        }
    }

    // ── Cancellation and dismissal ──────────────────────────────────

    /// Cancel an active task at the user's request. Distinct from failure:
    /// the terminal event carries an explicit cancelled flag.
    pub async fn cancel_task(&self, id: Uuid) -> Result<bool, Error> {
        let Some(task) = self.store.get_task(id).await.map_err(Error::from)? else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        self.fail_task(&task, "TASK_CANCELLED", CANCELLED_MESSAGE, true, true).await
    }

    /// Publish dismissed events for the caller's failed tasks. The rows are
    /// already terminal; dismissal only tells subscribers to drop them.
    pub async fn dismiss_failed_tasks(
        &self,
        user_id: &str,
        task_ids: &[Uuid],
    ) -> Result<usize, Error> {
        let mut dismissed = 0;
        for id in task_ids {
            let Some(task) = self.store.get_task(*id).await.map_err(Error::from)? else {
                continue;
            };
            if task.user_id != user_id || task.status != TaskStatus::Failed {
                continue;
            }
            self.publisher
                .publish_lifecycle(&task, LifecyclePayload::new(crate::events::LifecycleType::Dismissed), true)
                .await
                .map_err(Error::from)?;
            dismissed += 1;
        }
        Ok(dismissed)
    }

    // ── Billing compensation ────────────────────────────────────────

    /// Roll back whatever the task's stored billing info owes. Rollback
    /// errors are captured in the status, not propagated: the caller still
    /// needs to fail the task, just with an escalated code.
    pub async fn try_rollback(&self, task: &TaskRecord) -> RollbackStatus {
        match rollback_for_task(self.billing.as_ref(), task).await {
            Ok(outcome) if !outcome.attempted => RollbackStatus::Skipped,
            Ok(_) => {
                if let Some(info) = &task.billing_info {
                    let updated = billing_info_rolled_back(info);
                    if let Err(e) = self.store.update_billing_info(task.id, Some(&updated)).await {
                        warn!(task_id = %task.id, error = %e, "Failed to persist rolled-back billing info");
                    }
                }
                RollbackStatus::RolledBack
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Billing rollback failed");
                RollbackStatus::Failed(e.to_string())
            }
        }
    }

    async fn settle_billing(&self, task: &TaskRecord) {
        let Some(info) = TaskBillingInfo::parse(task.billing_info.as_ref()) else { return };
        if !info.needs_rollback() {
            return;
        }
        let Some(freeze_id) = info.freeze_id.as_deref() else { return };
        if let Err(e) = self.billing.settle(task.id, freeze_id).await {
            // The hold stays frozen; the next compensation sweep sees it.
            error!(task_id = %task.id, error = %e, "Billing settle failed");
            return;
        }
        if let Some(raw) = &task.billing_info {
            let mut updated = raw.clone();
            if let Some(obj) = updated.as_object_mut() {
                obj.insert("status".to_string(), Value::String("settled".to_string()));
            }
            if let Err(e) = self.store.update_billing_info(task.id, Some(&updated)).await {
                warn!(task_id = %task.id, error = %e, "Failed to persist settled billing info");
            }
        }
    }
}

// ── Lane worker executor ────────────────────────────────────────────

struct WorkerReporter {
    service: Arc<TaskService>,
    task: TaskRecord,
}

#[async_trait]
impl ProgressReporter for WorkerReporter {
    async fn progress(&self, _job: &Job, progress: u8, payload: Option<Value>) {
        if let Err(e) = self.service.report_progress(&self.task, progress, payload).await {
            warn!(task_id = %self.task.id, error = %e, "Progress report failed");
        }
    }

    async fn stream(&self, _job: &Job, payload: StreamPayload) {
        if let Err(e) = self.service.publisher().publish_stream(&self.task, payload, true).await {
            warn!(task_id = %self.task.id, error = %e, "Stream publish failed");
        }
    }
}

/// Job executor shared by all lanes: dispatches to the handler registered
/// for the task's kind and applies the terminal transition.
pub struct TaskWorker {
    service: Arc<TaskService>,
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl TaskWorker {
    pub fn new(service: Arc<TaskService>) -> Self {
        Self { service, handlers: HashMap::new() }
    }

    pub fn register(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }
}

#[async_trait]
impl JobExecutor for TaskWorker {
    async fn execute(&self, job: Job) {
        let task = match self.service.store().get_task(job.id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %job.id, "Job for unknown task, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %job.id, error = %e, "Failed to load task for job");
                return;
            }
        };

        match self.service.try_mark_processing(job.id).await {
            Ok(true) => {}
            Ok(false) => return, // already terminal, stale job
            Err(e) => {
                error!(task_id = %job.id, error = %e, "Processing transition failed");
                return;
            }
        }

        let Some(handler) = self.handlers.get(&job.kind) else {
            let message = format!("no handler registered for task kind {}", job.kind);
            if let Err(e) =
                self.service.fail_task(&task, "HANDLER_MISSING", &message, false, true).await
            {
                error!(task_id = %job.id, error = %e, "Failed to record missing handler");
            }
            return;
        };

        let reporter = WorkerReporter { service: self.service.clone(), task: task.clone() };
        let outcome = handler.run(&job, &reporter).await;
        let result = match outcome {
            Ok(result) => self.service.complete_task(&task, result).await,
            Err(failure) => {
                self.service.fail_task(&task, &failure.code, &failure.message, false, true).await
            }
        };
        if let Err(e) = result {
            error!(task_id = %job.id, error = %e, "Terminal transition failed");
        }
    }

    async fn handle_crash(&self, job: Job) {
        let task = match self.service.store().get_task(job.id).await {
            Ok(Some(task)) => task,
            _ => return,
        };
        if let Err(e) = self
            .service
            .fail_task(&task, "INTERNAL_ERROR", "worker crashed while processing the task", false, true)
            .await
        {
            error!(task_id = %job.id, error = %e, "Failed to record worker crash");
        }
    }
}
