//! Lane queues: routing, in-process lanes, liveness.

pub mod lane;
pub mod router;

use serde_json::Value;
use uuid::Uuid;

use crate::task::model::TaskKind;

pub use lane::{HandlerFailure, InProcessLane, JobExecutor, ProgressReporter, TaskHandler};
pub use router::{LivenessVerdict, QueueRouter};

/// An isolated queue/worker pool for one task-kind family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Image,
    Video,
    Voice,
    Text,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Image, Lane::Video, Lane::Voice, Lane::Text];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Voice => "voice",
            Self::Text => "text",
        }
    }

    /// The lane a task kind is routed to.
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::ImageCharacter | TaskKind::ImageLocation | TaskKind::ImagePanel => {
                Self::Image
            }
            TaskKind::VideoShot => Self::Video,
            TaskKind::VoiceLine => Self::Voice,
            TaskKind::TextGeneration | TaskKind::TextAnalysis => Self::Text,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States a lane reports for a job that still exists.
///
/// Any of these counts as "alive" for reconciliation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLiveness {
    Waiting,
    Active,
    Delayed,
    WaitingChildren,
}

/// A unit of work handed to a lane. The job id equals the task id so
/// resubmission dedupes at the lane level.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: Value,
    pub priority: i32,
}

/// One lane of the queue engine.
///
/// `job_state` must return `Err` when the inspection itself fails; it must
/// never report a job as absent just because the lane could not be asked.
#[async_trait::async_trait]
pub trait LaneQueue: Send + Sync {
    fn lane(&self) -> Lane;

    /// Enqueue a job. Returns `false` when a job with the same id is
    /// already known to the lane (dedupe no-op).
    async fn add(&self, job: Job) -> Result<bool, crate::error::QueueError>;

    /// Liveness of a job by id. `Ok(None)` affirmatively means the lane
    /// does not hold this job.
    async fn job_state(
        &self,
        id: Uuid,
    ) -> Result<Option<JobLiveness>, crate::error::QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_routes_to_a_lane() {
        assert_eq!(Lane::for_kind(TaskKind::ImageCharacter), Lane::Image);
        assert_eq!(Lane::for_kind(TaskKind::ImagePanel), Lane::Image);
        assert_eq!(Lane::for_kind(TaskKind::VideoShot), Lane::Video);
        assert_eq!(Lane::for_kind(TaskKind::VoiceLine), Lane::Voice);
        assert_eq!(Lane::for_kind(TaskKind::TextGeneration), Lane::Text);
        assert_eq!(Lane::for_kind(TaskKind::TextAnalysis), Lane::Text);
    }
}
