//! Submission front door: payload normalization, billing hold, enqueue, and
//! the compensation chain when the enqueue does not stick.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::BillingHold;
use crate::error::{BillingError, Error, SubmitError};
use crate::events::model::LifecyclePayload;
use crate::task::model::{NewTask, TaskIntent, TaskKind, TaskRecord, as_object};
use crate::task::service::{RollbackStatus, TaskService, resolve_compensation_failure};

pub const STAGE_ENQUEUE_FAILED: &str = "enqueue_failed";

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: TaskKind,
    pub target_type: String,
    pub target_id: String,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub user_id: String,
    pub project_id: String,
    pub episode_id: Option<String>,
    pub priority: i32,
    /// Credits to hold for this task. Zero means free.
    pub cost: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub task_id: Uuid,
    pub deduped: bool,
}

pub struct TaskSubmitter {
    service: Arc<TaskService>,
}

impl TaskSubmitter {
    pub fn new(service: Arc<TaskService>) -> Self {
        Self { service }
    }

    /// Accept a submission: normalize, create the ledger row, place the
    /// billing hold, publish the created event, and hand the job to its lane.
    ///
    /// An enqueue failure never strands a charged row: the billing hold is
    /// rolled back and the row failed before the error is returned.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, Error> {
        if request.target_type.trim().is_empty() || request.target_id.trim().is_empty() {
            return Err(Error::Submit(SubmitError::InvalidParams(
                "target_type and target_id are required".to_string(),
            )));
        }

        let payload = normalize_payload(request.kind, request.payload.clone());
        let created = self
            .service
            .create_task(NewTask {
                kind: request.kind,
                target_type: request.target_type.clone(),
                target_id: request.target_id.clone(),
                payload,
                dedupe_key: request.dedupe_key.clone(),
                billing_info: None,
                user_id: request.user_id.clone(),
                project_id: request.project_id.clone(),
                episode_id: request.episode_id.clone(),
                priority: request.priority,
            })
            .await?;
        if created.deduped {
            info!(task_id = %created.task.id, kind = %request.kind, "Submission deduped onto live task");
            return Ok(SubmitOutcome { task_id: created.task.id, deduped: true });
        }
        let mut task = created.task;

        if request.cost > 0 {
            let hold = self.prepare_billing(&task, &request).await?;
            let info = hold.to_billing_info();
            self.service
                .store()
                .update_billing_info(task.id, Some(&info))
                .await
                .map_err(Error::from)?;
            task.billing_info = Some(info);
        }

        self.service
            .publisher()
            .publish_lifecycle(&task, LifecyclePayload::created(), true)
            .await
            .map_err(Error::from)?;

        if let Err(enqueue_err) = self.service.router().submit(&task).await {
            return Err(self.compensate_enqueue_failure(&task, enqueue_err.to_string()).await);
        }

        if !self.service.store().mark_enqueued(task.id).await.map_err(Error::from)? {
            warn!(task_id = %task.id, "Enqueued stamp denied, row left the queued status");
        }
        info!(task_id = %task.id, kind = %task.kind, "Task submitted");
        Ok(SubmitOutcome { task_id: task.id, deduped: false })
    }

    /// Place the billing hold; a rejected hold fails the fresh row so it
    /// does not linger as queued.
    async fn prepare_billing(
        &self,
        task: &TaskRecord,
        request: &SubmitRequest,
    ) -> Result<BillingHold, Error> {
        match self
            .service
            .billing()
            .freeze(task.id, &request.user_id, request.cost)
            .await
        {
            Ok(hold) => Ok(hold),
            Err(e) => {
                let (code, message) = match &e {
                    BillingError::InsufficientBalance { .. } => {
                        ("INSUFFICIENT_BALANCE", e.to_string())
                    }
                    _ => ("INTERNAL_ERROR", format!("billing hold failed: {e}")),
                };
                if let Err(fail_err) =
                    self.service.fail_task(task, code, &message, false, true).await
                {
                    error!(task_id = %task.id, error = %fail_err, "Failed to record billing rejection");
                }
                match e {
                    BillingError::InsufficientBalance { .. } => {
                        Err(Error::Submit(SubmitError::InsufficientBalance(message)))
                    }
                    other => Err(Error::Billing(other)),
                }
            }
        }
    }

    /// The enqueue did not stick: record the attempt, release the hold, fail
    /// the row, and tell live subscribers with a non-persisted event. The
    /// event log keeps only the durable history; the watchdog or a retry
    /// reconciles the row from the ledger.
    async fn compensate_enqueue_failure(&self, task: &TaskRecord, reason: String) -> Error {
        warn!(task_id = %task.id, reason, "Enqueue failed, compensating");
        if let Err(e) = self.service.store().record_enqueue_failure(task.id, &reason).await {
            warn!(task_id = %task.id, error = %e, "Failed to record enqueue failure");
        }

        let rollback = self.service.try_rollback(task).await;
        let (code, message) = resolve_compensation_failure(
            &rollback,
            "ENQUEUE_FAILED",
            &format!("Failed to enqueue task: {reason}"),
        );

        match self.service.store().mark_failed(task.id, &code, &message).await {
            Ok(true) => {}
            Ok(false) => warn!(task_id = %task.id, "Failure transition denied during compensation"),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to fail task during compensation");
            }
        }

        let payload = LifecyclePayload {
            stage: Some(STAGE_ENQUEUE_FAILED.to_string()),
            ..LifecyclePayload::failed(&code, &message)
        };
        if let Err(e) = self.service.publisher().publish_lifecycle(task, payload, false).await {
            warn!(task_id = %task.id, error = %e, "Failed to broadcast enqueue failure");
        }

        if matches!(rollback, RollbackStatus::Failed(_)) {
            Error::Submit(SubmitError::BillingCompensationFailed {
                task_id: task.id,
                reason: message,
            })
        } else {
            Error::Submit(SubmitError::EnqueueFailed { task_id: task.id, reason })
        }
    }
}

/// Fill in the UI hints downstream consumers key off: every payload carries
/// `ui.intent` and `ui.hasOutputAtStart`, defaulted by task kind when the
/// caller left them out.
pub fn normalize_payload(kind: TaskKind, payload: Value) -> Value {
    let mut obj = match payload {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    let mut ui = obj
        .get("ui")
        .and_then(|v| as_object(v).cloned())
        .unwrap_or_default();
    let intent = TaskIntent::coerce(ui.get("intent").or_else(|| obj.get("intent")), kind);
    ui.insert("intent".to_string(), json!(intent.as_str()));
    ui.entry("hasOutputAtStart".to_string()).or_insert(Value::Bool(false));
    obj.insert("ui".to_string(), Value::Object(ui));

    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::InMemoryBillingLedger;
    use crate::error::QueueError;
    use crate::events::{LifecycleType, ProgressPublisher};
    use crate::queue::{Job, JobLiveness, Lane, LaneQueue, QueueRouter};
    use crate::store::{LibSqlStore, TaskStore};
    use crate::task::model::TaskStatus;
    use async_trait::async_trait;

    struct StubLane {
        lane: Lane,
        fail_adds: bool,
    }

    #[async_trait]
    impl LaneQueue for StubLane {
        fn lane(&self) -> Lane {
            self.lane
        }

        async fn add(&self, job: Job) -> Result<bool, QueueError> {
            if self.fail_adds {
                Err(QueueError::EnqueueFailed {
                    lane: self.lane.as_str().to_string(),
                    reason: format!("broker rejected job {}", job.id),
                })
            } else {
                Ok(true)
            }
        }

        async fn job_state(&self, _id: Uuid) -> Result<Option<JobLiveness>, QueueError> {
            Ok(Some(JobLiveness::Waiting))
        }
    }

    struct Fixture {
        submitter: TaskSubmitter,
        service: Arc<TaskService>,
        store: Arc<LibSqlStore>,
        billing: Arc<InMemoryBillingLedger>,
    }

    async fn fixture(balance: i64, fail_adds: bool) -> Fixture {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let billing = Arc::new(InMemoryBillingLedger::new().with_balance("u1", balance));
        let router = Arc::new(QueueRouter::new(vec![Arc::new(StubLane {
            lane: Lane::Image,
            fail_adds,
        })]));
        let publisher = Arc::new(ProgressPublisher::new(store.clone(), 64, 1000));
        let service = Arc::new(TaskService::new(
            store.clone(),
            router,
            billing.clone(),
            publisher,
        ));
        Fixture { submitter: TaskSubmitter::new(service.clone()), service, store, billing }
    }

    fn request(cost: i64, dedupe: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            kind: TaskKind::ImagePanel,
            target_type: "Panel".into(),
            target_id: "P1".into(),
            payload: json!({"prompt": "a quiet street"}),
            dedupe_key: dedupe.map(String::from),
            user_id: "u1".into(),
            project_id: "p1".into(),
            episode_id: Some("e1".into()),
            priority: 0,
            cost,
        }
    }

    #[tokio::test]
    async fn submit_charges_enqueues_and_publishes_created() {
        let f = fixture(100, false).await;
        let mut rx = f.service.publisher().subscribe();

        let outcome = f.submitter.submit(request(30, None)).await.unwrap();
        assert!(!outcome.deduped);

        let row = f.store.get_task(outcome.task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        assert!(row.enqueued_at.is_some());
        let info = row.billing_info.unwrap();
        assert_eq!(info["status"], "frozen");
        assert_eq!(f.billing.balance_of("u1"), 70);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.lifecycle_payload().unwrap().lifecycle_type,
            LifecycleType::Created
        );
    }

    #[tokio::test]
    async fn dedupe_short_circuits_before_billing() {
        let f = fixture(100, false).await;
        let first = f.submitter.submit(request(30, Some("k"))).await.unwrap();
        let second = f.submitter.submit(request(30, Some("k"))).await.unwrap();
        assert!(second.deduped);
        assert_eq!(second.task_id, first.task_id);
        // Only the first submission was charged.
        assert_eq!(f.billing.balance_of("u1"), 70);
    }

    #[tokio::test]
    async fn insufficient_balance_fails_the_row() {
        let f = fixture(10, false).await;
        let err = f.submitter.submit(request(30, None)).await.unwrap_err();
        assert!(matches!(err, Error::Submit(SubmitError::InsufficientBalance(_))));

        let rows = f
            .store
            .list_tasks_for_targets("p1", "u1", &[("Panel".to_string(), "P1".to_string())], None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskStatus::Failed);
        assert_eq!(rows[0].error_code.as_deref(), Some("INSUFFICIENT_BALANCE"));
        assert_eq!(f.billing.balance_of("u1"), 10);
    }

    #[tokio::test]
    async fn enqueue_failure_rolls_back_and_broadcasts_without_persisting() {
        let f = fixture(100, true).await;
        let mut rx = f.service.publisher().subscribe();

        let err = f.submitter.submit(request(30, None)).await.unwrap_err();
        let Error::Submit(SubmitError::EnqueueFailed { task_id, .. }) = err else {
            panic!("expected enqueue failure, got {err}");
        };

        let row = f.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.error_code.as_deref(), Some("ENQUEUE_FAILED"));
        assert_eq!(row.enqueue_attempts, 1);
        assert_eq!(f.billing.balance_of("u1"), 100);

        // Created was broadcast and persisted; the failure is broadcast only.
        let created = rx.recv().await.unwrap();
        assert_eq!(
            created.lifecycle_payload().unwrap().lifecycle_type,
            LifecycleType::Created
        );
        let failed = rx.recv().await.unwrap();
        let payload = failed.lifecycle_payload().unwrap();
        assert_eq!(payload.lifecycle_type, LifecycleType::Failed);
        assert_eq!(payload.stage.as_deref(), Some(STAGE_ENQUEUE_FAILED));

        let history = f.store.list_task_events(task_id, 100).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn rejects_blank_target() {
        let f = fixture(100, false).await;
        let mut bad = request(0, None);
        bad.target_id = "  ".into();
        let err = f.submitter.submit(bad).await.unwrap_err();
        assert!(matches!(err, Error::Submit(SubmitError::InvalidParams(_))));
    }

    #[test]
    fn normalize_fills_ui_defaults_and_keeps_explicit_intent() {
        let normalized = normalize_payload(TaskKind::ImagePanel, json!({"prompt": "x"}));
        assert_eq!(normalized["ui"]["intent"], "generate");
        assert_eq!(normalized["ui"]["hasOutputAtStart"], false);
        assert_eq!(normalized["prompt"], "x");

        let explicit = normalize_payload(
            TaskKind::ImagePanel,
            json!({"ui": {"intent": "process", "hasOutputAtStart": true}}),
        );
        assert_eq!(explicit["ui"]["intent"], "process");
        assert_eq!(explicit["ui"]["hasOutputAtStart"], true);
    }
}
