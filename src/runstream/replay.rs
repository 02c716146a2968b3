//! Recovery subscription: replay persisted history, then continue live.
//!
//! On (re)connect the full persisted event history is replayed through the
//! same mapping and reducer contract as live delivery, so consumers cannot
//! tell replay from live. Terminal detection covers both worker-originated
//! and reconcile-originated terminal events; if neither arrives, a poll
//! fallback watches the ledger until the task settles or the timeout fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::ProgressPublisher;
use crate::runstream::event::{RunEvent, map_task_event};
use crate::store::TaskStore;
use crate::task::error_message::resolve_task_error_summary;
use crate::task::model::{TaskRecord, TaskStatus};

/// Why the subscription settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySettle {
    /// A terminal run event was observed (replayed, live, or polled).
    Terminal,
    /// The timeout elapsed with the task still unresolved.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(1500), timeout: Duration::from_secs(1800) }
    }
}

/// Handle to a running recovery subscription.
///
/// Dropping the handle does not stop the subscription; call `cancel` to stop
/// it. Cancelling suppresses the settle callback if it has not fired and
/// leaks no timers.
pub struct ReplayHandle {
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl ReplayHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a cancel issued before the task
        // reaches its select still wakes it.
        self.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the subscription task to exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

fn is_terminal_run_event(event: &RunEvent) -> bool {
    matches!(
        event,
        RunEvent::RunError { .. } | RunEvent::RunComplete { .. } | RunEvent::RunDismissed
    )
}

/// Build the terminal run event a settled ledger row implies.
fn terminal_event_from_row(task: &TaskRecord) -> Option<RunEvent> {
    match task.status {
        TaskStatus::Completed => {
            Some(RunEvent::RunComplete { payload: task.result.clone(), message: None })
        }
        TaskStatus::Failed => {
            let raw = serde_json::json!({
                "code": task.error_code,
                "errorMessage": task.error_message,
            });
            Some(RunEvent::RunError {
                message: resolve_task_error_summary(&raw, "Task failed").message,
            })
        }
        _ => None,
    }
}

/// Start a recovery subscription for one task.
///
/// `apply` receives every run event in order — replayed history first, then
/// live events. `on_settled` is invoked exactly once, unless the handle is
/// cancelled first.
pub fn subscribe_recovered_run<A, S>(
    publisher: Arc<ProgressPublisher>,
    store: Arc<dyn TaskStore>,
    task_id: Uuid,
    options: ReplayOptions,
    mut apply: A,
    on_settled: S,
) -> ReplayHandle
where
    A: FnMut(RunEvent) + Send + 'static,
    S: FnOnce(ReplaySettle) + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let flag = cancelled.clone();
    let notified = wake.clone();

    let handle = tokio::spawn(async move {
        // Subscribe before replaying so no live event falls in the gap.
        let mut live = publisher.subscribe();
        let mut live_open = true;

        if flag.load(Ordering::SeqCst) {
            debug!(%task_id, "Recovery subscription cancelled before start");
            return;
        }

        let task = match store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(%task_id, "Recovery subscription for unknown task");
                if !flag.load(Ordering::SeqCst) {
                    on_settled(ReplaySettle::Terminal);
                }
                return;
            }
            Err(e) => {
                // Replay is best-effort; fall through to polling.
                warn!(%task_id, error = %e, "Failed to load task for replay");
                TaskRecord { id: task_id, ..placeholder_task() }
            }
        };

        // Phase 1: replay persisted history in log order.
        match publisher.list_task_events(&task).await {
            Ok(history) => {
                debug!(%task_id, events = history.len(), "Replaying persisted history");
                for wire_event in &history {
                    if flag.load(Ordering::SeqCst) {
                        debug!(%task_id, "Recovery subscription cancelled during replay");
                        return;
                    }
                    if wire_event.task_id != task_id {
                        continue;
                    }
                    for run_event in map_task_event(wire_event) {
                        let terminal = is_terminal_run_event(&run_event);
                        apply(run_event);
                        if terminal {
                            if !flag.load(Ordering::SeqCst) {
                                on_settled(ReplaySettle::Terminal);
                            }
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%task_id, error = %e, "Replay of persisted history failed");
            }
        }

        // Phase 2: continue live, with a poll fallback and a hard timeout.
        let mut poll = tokio::time::interval(options.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = notified.notified() => {
                    debug!(%task_id, "Recovery subscription cancelled");
                    return;
                }
                _ = &mut deadline => {
                    if !flag.load(Ordering::SeqCst) {
                        on_settled(ReplaySettle::Timeout);
                    }
                    return;
                }
                received = live.recv(), if live_open => {
                    match received {
                        Ok(wire_event) => {
                            if wire_event.task_id != task_id {
                                continue;
                            }
                            for run_event in map_task_event(&wire_event) {
                                let terminal = is_terminal_run_event(&run_event);
                                apply(run_event);
                                if terminal {
                                    if !flag.load(Ordering::SeqCst) {
                                        on_settled(ReplaySettle::Terminal);
                                    }
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(%task_id, missed, "Live feed lagged; relying on poll fallback");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            live_open = false;
                        }
                    }
                }
                _ = poll.tick() => {
                    match store.get_task(task_id).await {
                        Ok(Some(row)) => {
                            if let Some(run_event) = terminal_event_from_row(&row) {
                                apply(run_event);
                                if !flag.load(Ordering::SeqCst) {
                                    on_settled(ReplaySettle::Terminal);
                                }
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(%task_id, error = %e, "Terminal poll failed");
                        }
                    }
                }
            }
        }
    });

    ReplayHandle { cancelled, wake, handle }
}

// When the initial row load fails we still want the poll fallback to run;
// this placeholder only feeds the (empty) replay listing.
fn placeholder_task() -> TaskRecord {
    use crate::task::model::{NewTask, TaskKind};
    TaskRecord::new_queued(NewTask {
        kind: TaskKind::TextGeneration,
        target_type: String::new(),
        target_id: String::new(),
        payload: serde_json::Value::Null,
        dedupe_key: None,
        billing_info: None,
        user_id: String::new(),
        project_id: String::new(),
        episode_id: None,
        priority: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::events::model::LifecyclePayload;
    use crate::store::LibSqlStore;
    use crate::task::model::{NewTask, TaskKind};
    use serde_json::json;

    async fn setup() -> (Arc<ProgressPublisher>, Arc<LibSqlStore>, TaskRecord) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let publisher = Arc::new(ProgressPublisher::new(store.clone(), 64, 1000));
        let task = TaskRecord::new_queued(NewTask {
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
        });
        store.insert_task(&task).await.unwrap();
        (publisher, store, task)
    }

    fn collector() -> (Arc<Mutex<Vec<RunEvent>>>, impl FnMut(RunEvent) + Send + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |e| sink.lock().unwrap().push(e))
    }

    #[tokio::test]
    async fn reconcile_terminal_history_settles_exactly_once_with_no_live_events() {
        let (publisher, store, mut task) = setup().await;
        publisher.publish_lifecycle(&task, LifecyclePayload::created(), true).await.unwrap();
        // Watchdog failed the task out of band; no terminal event was logged.
        store.mark_failed(task.id, "RECONCILE_ORPHAN", "Queue job lost during reconciliation").await.unwrap();
        task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let settle_count = Arc::new(AtomicUsize::new(0));
        let counter = settle_count.clone();
        let (events, apply) = collector();

        let handle = subscribe_recovered_run(
            publisher,
            store,
            task.id,
            ReplayOptions { poll_interval: Duration::from_millis(50), timeout: Duration::from_secs(5) },
            apply,
            move |settle| {
                assert_eq!(settle, ReplaySettle::Terminal);
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.join().await;

        assert_eq!(settle_count.load(Ordering::SeqCst), 1);
        let events = events.lock().unwrap();
        assert!(matches!(events.last(), Some(RunEvent::RunError { .. })));
    }

    #[tokio::test]
    async fn poll_fallback_detects_late_terminal() {
        let (publisher, store, task) = setup().await;
        publisher.publish_lifecycle(&task, LifecyclePayload::created(), true).await.unwrap();

        let settle_count = Arc::new(AtomicUsize::new(0));
        let counter = settle_count.clone();
        let (events, apply) = collector();

        let handle = subscribe_recovered_run(
            publisher,
            store.clone(),
            task.id,
            ReplayOptions { poll_interval: Duration::from_millis(20), timeout: Duration::from_secs(5) },
            apply,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        // The worker finishes without publishing a live event.
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.mark_processing(task.id).await.unwrap();
        store.mark_completed(task.id, Some(&json!({"out": 1}))).await.unwrap();

        handle.join().await;
        assert_eq!(settle_count.load(Ordering::SeqCst), 1);
        assert!(matches!(events.lock().unwrap().last(), Some(RunEvent::RunComplete { .. })));
    }

    #[tokio::test]
    async fn live_terminal_event_settles_the_subscription() {
        let (publisher, store, task) = setup().await;

        let settle_count = Arc::new(AtomicUsize::new(0));
        let counter = settle_count.clone();
        let (_events, apply) = collector();

        let handle = subscribe_recovered_run(
            publisher.clone(),
            store,
            task.id,
            ReplayOptions { poll_interval: Duration::from_secs(30), timeout: Duration::from_secs(5) },
            apply,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        publisher
            .publish_lifecycle(&task, LifecyclePayload::failed("INTERNAL_ERROR", "boom"), false)
            .await
            .unwrap();

        handle.join().await;
        assert_eq!(settle_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_suppresses_settle() {
        let (publisher, store, task) = setup().await;

        let settle_count = Arc::new(AtomicUsize::new(0));
        let counter = settle_count.clone();
        let (_events, apply) = collector();

        let handle = subscribe_recovered_run(
            publisher,
            store,
            task.id,
            ReplayOptions { poll_interval: Duration::from_secs(30), timeout: Duration::from_secs(30) },
            apply,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();
        handle.join().await;
        assert_eq!(settle_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_before_task_runs_suppresses_settle() {
        let (publisher, store, task) = setup().await;
        // A failed row with no persisted terminal event would settle on the
        // very first poll tick if cancellation were lost.
        store.mark_failed(task.id, "INTERNAL_ERROR", "boom").await.unwrap();

        let settle_count = Arc::new(AtomicUsize::new(0));
        let counter = settle_count.clone();
        let (_events, apply) = collector();

        let handle = subscribe_recovered_run(
            publisher,
            store,
            task.id,
            ReplayOptions { poll_interval: Duration::from_millis(1), timeout: Duration::from_secs(30) },
            apply,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        // Cancel before yielding, so the spawned task has not run yet.
        handle.cancel();
        handle.join().await;
        assert_eq!(settle_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_with_terminal_history_suppresses_settle() {
        let (publisher, store, task) = setup().await;
        publisher.publish_lifecycle(&task, LifecyclePayload::created(), true).await.unwrap();
        publisher
            .publish_lifecycle(&task, LifecyclePayload::failed("INTERNAL_ERROR", "boom"), true)
            .await
            .unwrap();

        let settle_count = Arc::new(AtomicUsize::new(0));
        let counter = settle_count.clone();
        let (_events, apply) = collector();

        let handle = subscribe_recovered_run(
            publisher,
            store,
            task.id,
            ReplayOptions::default(),
            apply,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        // The terminal event sits in persisted history; a lost cancel would
        // fire the settle callback during replay.
        handle.cancel();
        handle.join().await;
        assert_eq!(settle_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_settles_with_timeout_reason() {
        let (publisher, store, task) = setup().await;

        let settled = Arc::new(Mutex::new(None));
        let slot = settled.clone();
        let (_events, apply) = collector();

        let handle = subscribe_recovered_run(
            publisher,
            store,
            task.id,
            ReplayOptions { poll_interval: Duration::from_secs(30), timeout: Duration::from_millis(60) },
            apply,
            move |settle| {
                *slot.lock().unwrap() = Some(settle);
            },
        );
        handle.join().await;
        assert_eq!(*settled.lock().unwrap(), Some(ReplaySettle::Timeout));
    }
}
