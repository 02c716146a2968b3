//! Pure run-stream reducer.
//!
//! One event in, next state out, no I/O. Replaying a log through this
//! reducer yields the same state as having watched the run live, which is
//! what makes reconnect recovery indistinguishable from live streaming.
//!
//! Ordering guarantees the reducer relies on: callers apply events one at a
//! time, in arrival order (live) or log order (replay), and never mutate one
//! run's state concurrently.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::runstream::event::{ChunkLane, RunEvent, split_retry_suffix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Dismissed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// Accumulated output on one lane of a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneBuffer {
    pub output: String,
    pub last_seq: Option<u64>,
}

impl LaneBuffer {
    /// Append a delta unless its sequence number was already seen.
    fn append(&mut self, seq: Option<u64>, delta: &str) -> bool {
        if let (Some(seq), Some(last)) = (seq, self.last_seq) {
            if seq <= last {
                return false;
            }
        }
        self.output.push_str(delta);
        if seq.is_some() {
            self.last_seq = seq;
        }
        true
    }
}

/// One logical step of a run. A retried step keeps its single slot in the
/// step order; only `attempt` moves.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStep {
    pub id: String,
    pub attempt: u32,
    pub title: Option<String>,
    pub index: Option<u32>,
    pub total: Option<u32>,
    pub status: StepStatus,
    pub text: LaneBuffer,
    pub reasoning: LaneBuffer,
    pub message: Option<String>,
    pub error_message: Option<String>,
    /// Logical timestamp of the last event that touched this step.
    pub touched_at: u64,
}

impl RunStep {
    fn new(id: String, attempt: u32, touched_at: u64) -> Self {
        Self {
            id,
            attempt,
            title: None,
            index: None,
            total: None,
            status: StepStatus::Running,
            text: LaneBuffer::default(),
            reasoning: LaneBuffer::default(),
            message: None,
            error_message: None,
            touched_at,
        }
    }

    fn lane_mut(&mut self, lane: ChunkLane) -> &mut LaneBuffer {
        match lane {
            ChunkLane::Text => &mut self.text,
            ChunkLane::Reasoning => &mut self.reasoning,
        }
    }

    /// Start a strictly higher attempt: output from earlier attempts is
    /// discarded before new chunks are accepted.
    fn bump_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.text = LaneBuffer::default();
        self.reasoning = LaneBuffer::default();
        self.status = StepStatus::Running;
        self.error_message = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStreamState {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Logical step ids in first-seen order.
    pub step_order: Vec<String>,
    pub steps_by_id: HashMap<String, RunStep>,
    /// Most recently started/updated running step, falling back to the last
    /// step in first-seen order once nothing is running.
    pub active_step_id: Option<String>,
    pub error_message: Option<String>,
    pub payload: Option<Value>,
    clock: u64,
}

impl RunStreamState {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            step_order: Vec::new(),
            steps_by_id: HashMap::new(),
            active_step_id: None,
            error_message: None,
            payload: None,
            clock: 0,
        }
    }

    pub fn step(&self, logical_id: &str) -> Option<&RunStep> {
        self.steps_by_id.get(logical_id)
    }

    /// Steps in first-seen order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &RunStep> {
        self.step_order.iter().filter_map(|id| self.steps_by_id.get(id))
    }

    fn ensure_step(&mut self, logical_id: &str, initial_attempt: u32) -> &mut RunStep {
        if !self.steps_by_id.contains_key(logical_id) {
            self.step_order.push(logical_id.to_string());
        }
        let clock = self.clock;
        self.steps_by_id
            .entry(logical_id.to_string())
            .or_insert_with(|| RunStep::new(logical_id.to_string(), initial_attempt.max(1), clock))
    }

    fn recompute_active_step(&mut self) {
        let running = self
            .steps_by_id
            .values()
            .filter(|s| s.status == StepStatus::Running)
            .max_by_key(|s| s.touched_at)
            .map(|s| s.id.clone());
        self.active_step_id = running.or_else(|| self.step_order.last().cloned());
    }
}

enum AttemptDecision {
    Stale,
    Current,
    Bump(u32),
}

fn decide_attempt(current: u32, incoming: Option<u32>) -> AttemptDecision {
    match incoming {
        None => AttemptDecision::Current,
        Some(a) if a < current => AttemptDecision::Stale,
        Some(a) if a == current => AttemptDecision::Current,
        Some(a) => AttemptDecision::Bump(a),
    }
}

/// Resolve the logical step id and effective attempt of a raw step id.
/// An explicit attempt is authoritative; the `#retry-N` suffix is a shim.
fn resolve_identity(raw_id: &str, explicit_attempt: Option<u32>) -> (String, Option<u32>) {
    let (logical, suffix_attempt) = split_retry_suffix(raw_id);
    (logical, explicit_attempt.or(suffix_attempt))
}

fn update_metadata(
    step: &mut RunStep,
    title: &Option<String>,
    index: Option<u32>,
    total: Option<u32>,
    message: &Option<String>,
) {
    if title.is_some() {
        step.title = title.clone();
    }
    if index.is_some() {
        step.index = index;
    }
    if total.is_some() {
        step.total = total;
    }
    if message.is_some() {
        step.message = message.clone();
    }
}

/// Apply one event, producing the next state. Pure: same inputs, same output.
pub fn apply_run_event(
    prev: Option<RunStreamState>,
    run_id: Uuid,
    event: &RunEvent,
) -> RunStreamState {
    let mut state = match prev {
        // A fresh run.start over a settled state begins a new run view.
        Some(s) if s.run_id == run_id
            && !(matches!(event, RunEvent::RunStart { .. }) && s.status.is_terminal()) => s,
        _ => RunStreamState::new(run_id),
    };
    // A settled run stays settled; late stragglers cannot reopen it.
    if state.status.is_terminal() && !matches!(event, RunEvent::RunStart { .. }) {
        return state;
    }
    state.clock += 1;

    match event {
        RunEvent::RunStart { .. } => {
            // Creation handled above; nothing else to record.
        }
        RunEvent::StepStart { step_id, step_attempt, title, index, total, message } => {
            let (logical, attempt) = resolve_identity(step_id, *step_attempt);
            let clock = state.clock;
            let step = state.ensure_step(&logical, attempt.unwrap_or(1));
            match decide_attempt(step.attempt, attempt) {
                AttemptDecision::Stale => {}
                AttemptDecision::Current => {
                    step.status = StepStatus::Running;
                    update_metadata(step, title, *index, *total, message);
                    step.touched_at = clock;
                }
                AttemptDecision::Bump(a) => {
                    step.bump_attempt(a);
                    update_metadata(step, title, *index, *total, message);
                    step.touched_at = clock;
                }
            }
        }
        RunEvent::StepChunk { step_id, step_attempt, lane, seq, delta } => {
            let (logical, attempt) = resolve_identity(step_id, *step_attempt);
            let clock = state.clock;
            let step = state.ensure_step(&logical, attempt.unwrap_or(1));
            match decide_attempt(step.attempt, attempt) {
                AttemptDecision::Stale => {}
                decision => {
                    if let AttemptDecision::Bump(a) = decision {
                        step.bump_attempt(a);
                    }
                    // A chunk after step.complete reopens the step.
                    step.status = StepStatus::Running;
                    if step.lane_mut(*lane).append(*seq, delta) {
                        step.touched_at = clock;
                    }
                }
            }
        }
        RunEvent::StepComplete { step_id, step_attempt, title, index, total, text, message } => {
            let (logical, attempt) = resolve_identity(step_id, *step_attempt);
            let clock = state.clock;
            let step = state.ensure_step(&logical, attempt.unwrap_or(1));
            match decide_attempt(step.attempt, attempt) {
                AttemptDecision::Stale => {}
                decision => {
                    if let AttemptDecision::Bump(a) = decision {
                        step.bump_attempt(a);
                    }
                    step.status = StepStatus::Completed;
                    update_metadata(step, title, *index, *total, message);
                    // A completion carrying full text is authoritative over
                    // whatever chunks accumulated.
                    if let Some(text) = text {
                        if !text.is_empty() {
                            step.text.output = text.clone();
                        }
                    }
                    step.touched_at = clock;
                }
            }
        }
        RunEvent::StepError { step_id, step_attempt, message } => {
            let (logical, attempt) = resolve_identity(step_id, *step_attempt);
            let clock = state.clock;
            let step = state.ensure_step(&logical, attempt.unwrap_or(1));
            match decide_attempt(step.attempt, attempt) {
                AttemptDecision::Stale => {}
                decision => {
                    if let AttemptDecision::Bump(a) = decision {
                        step.bump_attempt(a);
                    }
                    step.status = StepStatus::Failed;
                    step.error_message = Some(message.clone());
                    step.touched_at = clock;
                }
            }
        }
        RunEvent::RunError { message } => {
            state.status = RunStatus::Failed;
            state.error_message = Some(message.clone());
            // Steps not explicitly completed go down with the run.
            for step in state.steps_by_id.values_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Failed;
                    step.error_message = Some(message.clone());
                }
            }
        }
        RunEvent::RunComplete { payload, message: _ } => {
            state.status = RunStatus::Completed;
            state.payload = payload.clone();
            for step in state.steps_by_id.values_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Completed;
                }
            }
        }
        RunEvent::RunDismissed => {
            state.status = RunStatus::Dismissed;
        }
    }

    state.recompute_active_step();
    state
}

/// Render a step's output pane.
///
/// A failed step with no textual output gets a synthesized, visibly marked
/// error line instead of an empty pane.
pub fn stage_output(step: &RunStep) -> String {
    if !step.text.output.is_empty() {
        return step.text.output.clone();
    }
    if step.status == StepStatus::Failed {
        let message = step.error_message.as_deref().unwrap_or("Task failed");
        return format!("【错误】{message}");
    }
    String::new()
}
