//! Watchdog: periodically reconciles the task ledger against the lanes.
//!
//! Two sweeps run per cycle. The orphan sweep fails active rows whose queue
//! job is verifiably gone; a liveness check that errored is never read as
//! "gone" — those rows are left alone until a cycle gets a clean answer.
//! The heartbeat sweep fails processing rows whose worker stopped reporting.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Error;
use crate::events::model::LifecyclePayload;
use crate::queue::LivenessVerdict;
use crate::task::model::TaskRecord;
use crate::task::service::{TaskService, resolve_compensation_failure};

pub const REASON_JOB_MISSING: &str = "queue_job_missing";
pub const REASON_HEARTBEAT: &str = "heartbeat_timeout";

const ORPHAN_RECONCILE_MESSAGE: &str = "Queue job lost during reconciliation";
const HEARTBEAT_MESSAGE: &str = "Task heartbeat timeout";

/// What one reconcile cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphaned: Vec<Uuid>,
    pub timed_out: Vec<Uuid>,
    /// Active rows whose liveness could not be established this cycle.
    pub inconclusive: usize,
}

pub struct Watchdog {
    service: Arc<TaskService>,
    config: EngineConfig,
    shutdown: Notify,
}

impl Watchdog {
    pub fn new(service: Arc<TaskService>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self { service, config, shutdown: Notify::new() })
    }

    /// Run reconcile cycles until `stop` is called.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog.config.watchdog_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = watchdog.shutdown.notified() => {
                        info!("Watchdog stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        match watchdog.reconcile_once().await {
                            Ok(report) => {
                                if !report.orphaned.is_empty() || !report.timed_out.is_empty() {
                                    info!(
                                        orphaned = report.orphaned.len(),
                                        timed_out = report.timed_out.len(),
                                        inconclusive = report.inconclusive,
                                        "Reconcile cycle repaired tasks"
                                    );
                                }
                            }
                            Err(e) => error!(error = %e, "Reconcile cycle failed"),
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// One full reconcile cycle: orphan sweep then heartbeat sweep.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, Error> {
        let mut report = ReconcileReport::default();
        self.sweep_orphans(&mut report).await?;
        self.sweep_heartbeats(&mut report).await?;
        Ok(report)
    }

    async fn sweep_orphans(&self, report: &mut ReconcileReport) -> Result<(), Error> {
        let active = self
            .service
            .store()
            .list_active_tasks(self.config.watchdog_batch_limit)
            .await
            .map_err(Error::from)?;
        let grace_cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.orphan_grace)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));

        for task in active {
            // Freshly touched rows get a grace window: the enqueue may still
            // be in flight or the broker catching up after a restart.
            if task.updated_at > grace_cutoff {
                continue;
            }
            match self.service.router().job_verdict(task.id).await {
                LivenessVerdict::Alive { lane, state } => {
                    debug!(task_id = %task.id, %lane, ?state, "Active task has a live job");
                }
                LivenessVerdict::Inconclusive { errors } => {
                    report.inconclusive += 1;
                    error!(
                        task_id = %task.id,
                        project_id = %task.project_id,
                        errors = errors.len(),
                        "Liveness inconclusive, leaving task for the next cycle"
                    );
                }
                LivenessVerdict::Missing => {
                    self.fail_reconciled(
                        &task,
                        "RECONCILE_ORPHAN",
                        ORPHAN_RECONCILE_MESSAGE,
                        REASON_JOB_MISSING,
                    )
                    .await?;
                    report.orphaned.push(task.id);
                }
            }
        }
        Ok(())
    }

    async fn sweep_heartbeats(&self, report: &mut ReconcileReport) -> Result<(), Error> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.heartbeat_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let stale = self
            .service
            .store()
            .list_stale_processing(cutoff, self.config.watchdog_batch_limit)
            .await
            .map_err(Error::from)?;

        for task in stale {
            self.fail_reconciled(&task, "WATCHDOG_TIMEOUT", HEARTBEAT_MESSAGE, REASON_HEARTBEAT)
                .await?;
            report.timed_out.push(task.id);
        }
        Ok(())
    }

    /// Fail a row on the watchdog's authority: billing rolled back, terminal
    /// event stamped with the reconcile source so consumers can tell it
    /// apart from a worker-reported failure.
    async fn fail_reconciled(
        &self,
        task: &TaskRecord,
        code: &str,
        message: &str,
        reason: &str,
    ) -> Result<(), Error> {
        let rollback = self.service.try_rollback(task).await;
        let (code, message) = resolve_compensation_failure(&rollback, code, message);

        let applied =
            self.service.store().mark_failed(task.id, &code, &message).await.map_err(Error::from)?;
        if !applied {
            // The worker won the race; nothing to repair.
            warn!(task_id = %task.id, "Reconcile failure denied, row already moved on");
            return Ok(());
        }

        let payload = LifecyclePayload::failed(&code, &message).from_reconcile(reason);
        self.service
            .publisher()
            .publish_lifecycle(task, payload, true)
            .await
            .map_err(Error::from)?;
        warn!(task_id = %task.id, code, reason, "Watchdog failed task");
        Ok(())
    }
}
