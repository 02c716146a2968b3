//! Run-stream reconstruction: event mapping, the pure reducer, and replay.

pub mod event;
pub mod replay;
pub mod state;

pub use event::{ChunkLane, RunEvent, map_task_event, split_retry_suffix};
pub use replay::{ReplayHandle, ReplayOptions, ReplaySettle, subscribe_recovered_run};
pub use state::{RunStatus, RunStep, RunStreamState, StepStatus, apply_run_event, stage_output};
