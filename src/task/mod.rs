//! Task ledger: data model, guarded transitions, submission, state resolution.

pub mod error_message;
pub mod model;
pub mod resolver;
pub mod service;
pub mod submitter;

pub use model::{TaskBillingInfo, TaskIntent, TaskKind, TaskRecord, TaskStatus};
pub use resolver::{TargetPhase, TargetQuery, TargetState};
pub use service::{CreateOutcome, RollbackStatus, TaskService, TaskWorker};
pub use submitter::{SubmitOutcome, SubmitRequest, TaskSubmitter};
