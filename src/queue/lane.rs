//! In-process lane: a priority queue, a job registry mirroring broker
//! liveness states, and a pool of worker tasks.
//!
//! The registry keeps every known job id with its liveness until the job
//! reaches a terminal outcome, at which point the entry is removed — the
//! same observable behavior as a real broker, so reconciliation works
//! identically against either.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::events::model::StreamPayload;
use crate::queue::{Job, JobLiveness, Lane, LaneQueue};

/// A handler's terminal failure, carried into the ledger as code + message.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub code: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

/// Sink a handler reports incremental progress through.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Update ledger progress (and optionally the payload stage fields) and
    /// publish a processing lifecycle event.
    async fn progress(&self, job: &Job, progress: u8, payload: Option<Value>);

    /// Publish one stream chunk.
    async fn stream(&self, job: &Job, payload: StreamPayload);
}

/// Executes the work for one task kind.
///
/// Returning `Ok` completes the task with the given result; returning `Err`
/// fails it with the carried code and message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        reporter: &dyn ProgressReporter,
    ) -> Result<Option<Value>, HandlerFailure>;
}

/// Consumes jobs a lane's workers pull off the queue.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Run one job end to end, including its ledger transitions. Must not
    /// leave the task in a non-terminal state on failure.
    async fn execute(&self, job: Job);

    /// Called when `execute` panicked or was aborted mid-job.
    async fn handle_crash(&self, job: Job);
}

struct QueuedJob {
    priority: i32,
    seq: u64,
    job: Job,
}

// Higher priority first, FIFO within a priority.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority).then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

struct LaneState {
    waiting: BinaryHeap<QueuedJob>,
    registry: HashMap<Uuid, JobLiveness>,
    next_seq: u64,
    closed: bool,
}

/// One in-process lane with its own worker pool.
pub struct InProcessLane {
    lane: Lane,
    state: Mutex<LaneState>,
    notify: Notify,
    executor: Arc<dyn JobExecutor>,
}

impl InProcessLane {
    /// Create the lane and spawn `concurrency` worker tasks.
    pub fn start(lane: Lane, concurrency: usize, executor: Arc<dyn JobExecutor>) -> Arc<Self> {
        let this = Arc::new(Self {
            lane,
            state: Mutex::new(LaneState {
                waiting: BinaryHeap::new(),
                registry: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            executor,
        });
        for worker in 0..concurrency.max(1) {
            let lane = this.clone();
            tokio::spawn(async move {
                lane.worker_loop(worker).await;
            });
        }
        this
    }

    /// Stop accepting jobs and let the workers drain and exit.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(lane = %self.lane, worker, "Lane worker started");
        loop {
            let job = loop {
                let notified = self.notify.notified();
                {
                    let mut state = self.state.lock().await;
                    if let Some(queued) = state.waiting.pop() {
                        state.registry.insert(queued.job.id, JobLiveness::Active);
                        break queued.job;
                    }
                    if state.closed {
                        debug!(lane = %self.lane, worker, "Lane worker stopped");
                        return;
                    }
                }
                notified.await;
            };

            let job_id = job.id;
            let crash_copy = job.clone();
            let executor = self.executor.clone();
            // Run in a child task so a panicking handler takes down only
            // this job, not the worker.
            let outcome = tokio::spawn(async move { executor.execute(job).await }).await;
            if let Err(e) = outcome {
                error!(lane = %self.lane, task_id = %job_id, error = %e, "Job crashed");
                self.executor.handle_crash(crash_copy).await;
            }
            self.state.lock().await.registry.remove(&job_id);
        }
    }
}

#[async_trait]
impl LaneQueue for InProcessLane {
    fn lane(&self) -> Lane {
        self.lane
    }

    async fn add(&self, job: Job) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Unavailable {
                lane: self.lane.as_str().to_string(),
                reason: "lane is closed".to_string(),
            });
        }
        if state.registry.contains_key(&job.id) {
            warn!(lane = %self.lane, task_id = %job.id, "Duplicate job id, enqueue is a no-op");
            return Ok(false);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.registry.insert(job.id, JobLiveness::Waiting);
        state.waiting.push(QueuedJob { priority: job.priority, seq, job });
        drop(state);
        self.notify.notify_one();
        Ok(true)
    }

    async fn job_state(&self, id: Uuid) -> Result<Option<JobLiveness>, QueueError> {
        Ok(self.state.lock().await.registry.get(&id).copied())
    }
}
