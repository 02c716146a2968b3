//! Target state resolution.
//!
//! Derives one current-phase view per (target_type, target_id) pair from the
//! ledger. This is the only interface callers should use to ask "is this
//! entity busy right now"; they never inspect individual task rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::task::error_message::resolve_task_error_summary;
use crate::task::model::{TaskIntent, TaskKind, TaskRecord, extract_state_fields};

/// One query in a batch: a target pair plus an optional kind filter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetQuery {
    pub target_type: String,
    pub target_id: String,
    #[serde(default)]
    pub kinds: Option<Vec<TaskKind>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPhase {
    Idle,
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Normalized error surfaced on a failed target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetLastError {
    pub code: Option<String>,
    pub message: String,
}

/// Derived, non-persisted view of a target's current phase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
    pub target_type: String,
    pub target_id: String,
    pub phase: TargetPhase,
    pub running_task_id: Option<Uuid>,
    pub running_task_kind: Option<TaskKind>,
    pub intent: Option<TaskIntent>,
    pub has_output_at_start: Option<bool>,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub stage_label: Option<String>,
    pub last_error: Option<TargetLastError>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TargetState {
    fn idle(query: &TargetQuery) -> Self {
        Self {
            target_type: query.target_type.clone(),
            target_id: query.target_id.clone(),
            phase: TargetPhase::Idle,
            running_task_id: None,
            running_task_kind: None,
            intent: None,
            has_output_at_start: None,
            progress: None,
            stage: None,
            stage_label: None,
            last_error: None,
            updated_at: None,
        }
    }
}

fn matches_kinds(row: &TaskRecord, kinds: Option<&[TaskKind]>) -> bool {
    match kinds {
        Some(kinds) => kinds.contains(&row.kind),
        None => true,
    }
}

/// Resolve the state of one target from its already-fetched rows.
///
/// Pure and side-effect-free. Rows need not be sorted; the most-recently
/// updated active row wins, falling back to the most-recently-updated
/// terminal row, falling back to idle.
pub fn resolve_target_state(query: &TargetQuery, rows: &[&TaskRecord]) -> TargetState {
    let kinds = query.kinds.as_deref();
    let mut candidates: Vec<&TaskRecord> = rows
        .iter()
        .copied()
        .filter(|r| {
            r.target_type == query.target_type
                && r.target_id == query.target_id
                && matches_kinds(r, kinds)
        })
        .collect();
    candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let picked = candidates
        .iter()
        .find(|r| r.status.is_active())
        .or_else(|| candidates.first());
    let Some(row) = picked else {
        return TargetState::idle(query);
    };

    let fields = extract_state_fields(row.kind, &row.payload);
    let mut state = TargetState {
        target_type: query.target_type.clone(),
        target_id: query.target_id.clone(),
        phase: TargetPhase::Idle,
        running_task_id: None,
        running_task_kind: Some(row.kind),
        intent: Some(fields.intent),
        has_output_at_start: fields.has_output_at_start,
        progress: Some(row.progress),
        stage: fields.stage,
        stage_label: fields.stage_label,
        last_error: None,
        updated_at: Some(row.updated_at),
    };

    match row.status {
        crate::task::model::TaskStatus::Queued => {
            state.phase = TargetPhase::Queued;
            state.running_task_id = Some(row.id);
        }
        crate::task::model::TaskStatus::Processing => {
            state.phase = TargetPhase::Processing;
            state.running_task_id = Some(row.id);
        }
        crate::task::model::TaskStatus::Completed => {
            state.phase = TargetPhase::Completed;
            state.progress = Some(100);
        }
        crate::task::model::TaskStatus::Failed => {
            state.phase = TargetPhase::Failed;
            state.progress = None;
            let payload = serde_json::json!({
                "code": row.error_code,
                "errorMessage": row.error_message,
            });
            let summary = resolve_task_error_summary(&payload, "Task failed");
            state.last_error = Some(TargetLastError {
                code: summary.code,
                message: summary.message,
            });
        }
    }
    state
}

/// Resolve a batch of target queries in one pass.
///
/// Underlying reads are chunked to at most `batch_size` target pairs per
/// store query to bound predicate cost; kind filtering is applied per query
/// in the application since queries in one batch may filter differently.
pub async fn query_target_states(
    store: &dyn TaskStore,
    project_id: &str,
    user_id: &str,
    queries: &[TargetQuery],
    batch_size: usize,
) -> Result<Vec<TargetState>, DatabaseError> {
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    for q in queries {
        let pair = (q.target_type.clone(), q.target_id.clone());
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }

    let batch_size = batch_size.max(1);
    let mut rows: Vec<TaskRecord> = Vec::new();
    for chunk in pairs.chunks(batch_size) {
        rows.extend(store.list_tasks_for_targets(project_id, user_id, chunk, None).await?);
    }

    let refs: Vec<&TaskRecord> = rows.iter().collect();
    Ok(queries.iter().map(|q| resolve_target_state(q, &refs)).collect())
}
