//! Event fan-out and replay listing.
//!
//! Lifecycle events are persisted to the event log and broadcast; stream
//! events are broadcast and persisted only when asked (they are cheap to
//! regenerate and high-volume). Publishing never blocks on subscribers and
//! tolerates there being none.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::events::model::{LifecyclePayload, LifecycleType, StreamPayload, TaskEvent};
use crate::store::{NewEvent, TaskStore};
use crate::task::model::TaskRecord;

pub struct ProgressPublisher {
    store: Arc<dyn TaskStore>,
    tx: broadcast::Sender<TaskEvent>,
    replay_limit: usize,
}

impl ProgressPublisher {
    pub fn new(store: Arc<dyn TaskStore>, channel_capacity: usize, replay_limit: usize) -> Self {
        let (tx, _rx) = broadcast::channel(channel_capacity);
        Self { store, tx, replay_limit }
    }

    /// Subscribe to the live feed. Each consumer calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Persist (by default) and broadcast a lifecycle event.
    pub async fn publish_lifecycle(
        &self,
        task: &TaskRecord,
        payload: LifecyclePayload,
        persist: bool,
    ) -> Result<(), DatabaseError> {
        let event = TaskEvent::lifecycle(task, payload);
        if persist {
            self.persist(&event).await?;
        }
        // Ok if no receivers are listening.
        let _ = self.tx.send(event);
        Ok(())
    }

    /// Broadcast a stream chunk, persisting it when `persist` is set.
    pub async fn publish_stream(
        &self,
        task: &TaskRecord,
        payload: StreamPayload,
        persist: bool,
    ) -> Result<(), DatabaseError> {
        let event = TaskEvent::stream(task, payload);
        if persist {
            self.persist(&event).await?;
        }
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn persist(&self, event: &TaskEvent) -> Result<(), DatabaseError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.store
            .insert_event(&NewEvent {
                task_id: event.task_id,
                project_id: event.project_id.clone(),
                user_id: event.user_id.clone(),
                event_type: event.persisted_type().to_string(),
                payload,
            })
            .await?;
        Ok(())
    }

    /// Full persisted history for one task, in log order, ready for replay.
    ///
    /// When the ledger row is already terminal but the log carries no
    /// matching terminal lifecycle event (the worker died before logging
    /// it, or the watchdog failed the task out of band), a synthetic
    /// terminal event sourced from the ledger is appended, so replay
    /// consumers settle instead of waiting for an event that will never
    /// arrive.
    pub async fn list_task_events(&self, task: &TaskRecord) -> Result<Vec<TaskEvent>, DatabaseError> {
        let rows = self.store.list_task_events(task.id, self.replay_limit).await?;
        let mut events: Vec<TaskEvent> = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<TaskEvent>(row.payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // Old or foreign rows are skipped, not fatal.
                    warn!(task_id = %task.id, event_id = row.id, error = %e, "Skipping unreadable event row");
                }
            }
        }

        if let Some(expected) = TaskEvent::terminal_type_for(task.status) {
            // Non-terminal lifecycle events (a dismissal, say) can be logged
            // after the terminal one, so search the whole log.
            let logged_terminal = events
                .iter()
                .rev()
                .filter_map(|e| e.lifecycle_payload())
                .find(|p| p.lifecycle_type.is_terminal())
                .map(|p| p.lifecycle_type);

            let reason = match logged_terminal {
                Some(t) if t == expected => None,
                Some(_) => Some("terminal_event_mismatch"),
                None => Some("terminal_event_missing"),
            };

            if let Some(reason) = reason {
                debug!(task_id = %task.id, status = %task.status, reason, "Synthesizing terminal event from ledger");
                let payload = match expected {
                    LifecycleType::Completed => LifecyclePayload::completed(),
                    _ => LifecyclePayload::failed(
                        task.error_code.as_deref().unwrap_or("INTERNAL_ERROR"),
                        task.error_message.as_deref().unwrap_or("Task failed"),
                    ),
                }
                .from_reconcile(reason);
                events.push(TaskEvent::lifecycle(task, payload));
            }
        }

        Ok(events)
    }
}

/// Convenience: does this replayed history end in a settled run?
pub fn history_is_terminal(events: &[TaskEvent]) -> bool {
    events.iter().any(TaskEvent::is_terminal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use crate::task::model::{NewTask, TaskKind, TaskStatus};
    use serde_json::json;

    fn task() -> TaskRecord {
        TaskRecord::new_queued(NewTask {
            kind: TaskKind::TextGeneration,
            target_type: "Storyboard".into(),
            target_id: "B2".into(),
            payload: json!({}),
            dedupe_key: None,
            billing_info: None,
            user_id: "u1".into(),
            project_id: "p1".into(),
            episode_id: None,
            priority: 0,
        })
    }

    async fn publisher() -> (ProgressPublisher, Arc<LibSqlStore>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        (ProgressPublisher::new(store.clone(), 64, 1000), store)
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_error() {
        let (publisher, _store) = publisher().await;
        let task = task();
        publisher.publish_lifecycle(&task, LifecyclePayload::created(), true).await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let (publisher, _store) = publisher().await;
        let mut rx = publisher.subscribe();
        let task = task();
        publisher
            .publish_lifecycle(&task, LifecyclePayload::processing(25, None, None), true)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, task.id);
        assert_eq!(event.lifecycle_payload().unwrap().progress, Some(25));
    }

    #[tokio::test]
    async fn replay_returns_history_in_log_order() {
        let (publisher, _store) = publisher().await;
        let mut task = task();
        publisher.publish_lifecycle(&task, LifecyclePayload::created(), true).await.unwrap();
        publisher
            .publish_lifecycle(&task, LifecyclePayload::processing(50, None, None), true)
            .await
            .unwrap();
        publisher.publish_lifecycle(&task, LifecyclePayload::completed(), true).await.unwrap();
        task.status = TaskStatus::Completed;

        let events = publisher.list_task_events(&task).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].lifecycle_payload().unwrap().lifecycle_type, LifecycleType::Created);
        assert!(events[2].is_terminal());
        // Log already terminal: nothing synthesized.
        assert_eq!(events[2].lifecycle_payload().unwrap().source, None);
    }

    #[tokio::test]
    async fn replay_synthesizes_missing_terminal_event() {
        let (publisher, _store) = publisher().await;
        let mut task = task();
        publisher.publish_lifecycle(&task, LifecyclePayload::created(), true).await.unwrap();
        task.status = TaskStatus::Failed;
        task.error_code = Some("RECONCILE_ORPHAN".into());
        task.error_message = Some("Queue job lost during reconciliation".into());

        let events = publisher.list_task_events(&task).await.unwrap();
        let last = events.last().unwrap().lifecycle_payload().unwrap();
        assert_eq!(last.lifecycle_type, LifecycleType::Failed);
        assert_eq!(last.source.as_deref(), Some("db_reconcile"));
        assert_eq!(last.reconcile_reason.as_deref(), Some("terminal_event_missing"));
        assert_eq!(last.error_code.as_deref(), Some("RECONCILE_ORPHAN"));
    }

    #[tokio::test]
    async fn replay_corrects_mismatched_terminal_event() {
        let (publisher, _store) = publisher().await;
        let mut task = task();
        // Log says failed, ledger says completed.
        publisher
            .publish_lifecycle(&task, LifecyclePayload::failed("X", "transient"), true)
            .await
            .unwrap();
        task.status = TaskStatus::Completed;

        let events = publisher.list_task_events(&task).await.unwrap();
        let last = events.last().unwrap().lifecycle_payload().unwrap();
        assert_eq!(last.lifecycle_type, LifecycleType::Completed);
        assert_eq!(last.reconcile_reason.as_deref(), Some("terminal_event_mismatch"));
    }

    #[tokio::test]
    async fn replay_of_dismissed_failed_task_does_not_duplicate_terminal() {
        let (publisher, _store) = publisher().await;
        let mut task = task();
        publisher.publish_lifecycle(&task, LifecyclePayload::created(), true).await.unwrap();
        publisher
            .publish_lifecycle(&task, LifecyclePayload::failed("GENERATION_FAILED", "boom"), true)
            .await
            .unwrap();
        // Dismissal logs a non-terminal lifecycle event after the failure.
        publisher
            .publish_lifecycle(&task, LifecyclePayload::new(LifecycleType::Dismissed), true)
            .await
            .unwrap();
        task.status = TaskStatus::Failed;

        let events = publisher.list_task_events(&task).await.unwrap();
        assert_eq!(events.len(), 3);
        let terminals: Vec<_> = events
            .iter()
            .filter_map(|e| e.lifecycle_payload())
            .filter(|p| p.lifecycle_type.is_terminal())
            .collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].source, None);
    }

    #[tokio::test]
    async fn unpersisted_events_broadcast_but_do_not_replay() {
        let (publisher, store) = publisher().await;
        let task = task();
        publisher
            .publish_lifecycle(&task, LifecyclePayload::failed("ENQUEUE_FAILED", "lane down"), false)
            .await
            .unwrap();
        let rows = store.list_task_events(task.id, 10).await.unwrap();
        assert!(rows.is_empty());
    }
}
