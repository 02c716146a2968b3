//! Routing of tasks into lanes and cross-lane liveness checks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Job, JobLiveness, Lane, LaneQueue};
use crate::task::model::TaskRecord;

/// Result of asking every lane whether a job still exists.
///
/// `Missing` is only returned when every lane affirmatively answered "not
/// here" with zero inspection errors. If any inspection failed and no lane
/// affirmed liveness, the verdict is `Inconclusive`: the caller must not
/// treat the job as dead.
#[derive(Debug)]
pub enum LivenessVerdict {
    Alive { lane: Lane, state: JobLiveness },
    Missing,
    Inconclusive { errors: Vec<QueueError> },
}

impl LivenessVerdict {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive { .. })
    }
}

/// Routes tasks into lanes by kind.
pub struct QueueRouter {
    lanes: HashMap<Lane, Arc<dyn LaneQueue>>,
}

impl QueueRouter {
    pub fn new(lanes: Vec<Arc<dyn LaneQueue>>) -> Self {
        Self { lanes: lanes.into_iter().map(|l| (l.lane(), l)).collect() }
    }

    /// Enqueue a task into the lane its kind maps to. Returns `false` when
    /// the lane already knew the job id (resubmission no-op).
    pub async fn submit(&self, task: &TaskRecord) -> Result<bool, QueueError> {
        let lane = Lane::for_kind(task.kind);
        let queue = self.lanes.get(&lane).ok_or_else(|| QueueError::NoLaneForKind {
            kind: task.kind.as_str().to_string(),
        })?;
        let added = queue
            .add(Job {
                id: task.id,
                kind: task.kind,
                payload: task.payload.clone(),
                priority: task.priority,
            })
            .await?;
        debug!(task_id = %task.id, %lane, priority = task.priority, added, "Task routed");
        Ok(added)
    }

    /// Check job liveness across every lane.
    ///
    /// All lanes are asked, not only the one the task's kind maps to: the
    /// kind-to-lane mapping is an implementation detail a reconciler must
    /// not trust blindly. One affirmative answer settles the verdict as
    /// alive even when other lanes errored.
    pub async fn job_verdict(&self, id: Uuid) -> LivenessVerdict {
        let mut errors = Vec::new();
        for (lane, queue) in &self.lanes {
            match queue.job_state(id).await {
                Ok(Some(state)) => {
                    return LivenessVerdict::Alive { lane: *lane, state };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %id, lane = %lane, error = %e, "Lane liveness check failed");
                    errors.push(e);
                }
            }
        }
        if errors.is_empty() {
            LivenessVerdict::Missing
        } else {
            LivenessVerdict::Inconclusive { errors }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::task::model::{NewTask, TaskKind};

    enum StubBehavior {
        Holds(JobLiveness),
        Empty,
        Errors,
    }

    struct StubLane {
        lane: Lane,
        behavior: StubBehavior,
    }

    #[async_trait]
    impl LaneQueue for StubLane {
        fn lane(&self) -> Lane {
            self.lane
        }

        async fn add(&self, _job: Job) -> Result<bool, QueueError> {
            Ok(true)
        }

        async fn job_state(&self, _id: Uuid) -> Result<Option<JobLiveness>, QueueError> {
            match &self.behavior {
                StubBehavior::Holds(state) => Ok(Some(*state)),
                StubBehavior::Empty => Ok(None),
                StubBehavior::Errors => Err(QueueError::LivenessCheckFailed {
                    lane: self.lane.as_str().to_string(),
                    reason: "broker unreachable".to_string(),
                }),
            }
        }
    }

    fn router(behaviors: [StubBehavior; 4]) -> QueueRouter {
        let [image, video, voice, text] = behaviors;
        QueueRouter::new(vec![
            Arc::new(StubLane { lane: Lane::Image, behavior: image }),
            Arc::new(StubLane { lane: Lane::Video, behavior: video }),
            Arc::new(StubLane { lane: Lane::Voice, behavior: voice }),
            Arc::new(StubLane { lane: Lane::Text, behavior: text }),
        ])
    }

    fn task(kind: TaskKind) -> TaskRecord {
        TaskRecord::new_queued(NewTask {
            kind,
            target_type: "CharacterAppearance".into(),
            target_id: "A1".into(),
            payload: json!({}),
            dedupe_key: None,
            billing_info: None,
            user_id: "u1".into(),
            project_id: "p1".into(),
            episode_id: None,
            priority: 0,
        })
    }

    #[tokio::test]
    async fn missing_lane_is_an_error() {
        let router = QueueRouter::new(vec![]);
        let err = router.submit(&task(TaskKind::VideoShot)).await.unwrap_err();
        assert!(matches!(err, QueueError::NoLaneForKind { .. }));
    }

    #[tokio::test]
    async fn all_lanes_erroring_is_inconclusive_not_missing() {
        let router = router([
            StubBehavior::Errors,
            StubBehavior::Errors,
            StubBehavior::Errors,
            StubBehavior::Errors,
        ]);
        let verdict = router.job_verdict(Uuid::new_v4()).await;
        match verdict {
            LivenessVerdict::Inconclusive { errors } => assert_eq!(errors.len(), 4),
            other => panic!("expected inconclusive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_affirmative_lane_outweighs_errors() {
        let router = router([
            StubBehavior::Errors,
            StubBehavior::Errors,
            StubBehavior::Holds(JobLiveness::Active),
            StubBehavior::Empty,
        ]);
        let verdict = router.job_verdict(Uuid::new_v4()).await;
        assert!(verdict.is_alive());
    }

    #[tokio::test]
    async fn unanimous_absence_is_missing() {
        let router = router([
            StubBehavior::Empty,
            StubBehavior::Empty,
            StubBehavior::Empty,
            StubBehavior::Empty,
        ]);
        let verdict = router.job_verdict(Uuid::new_v4()).await;
        assert!(matches!(verdict, LivenessVerdict::Missing));
    }
}
