//! REST + WebSocket surface: submit, snapshot, target states, cancel,
//! dismiss, and the project-scoped live event feed.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, SubmitError};
use crate::events::TaskEvent;
use crate::task::model::TaskKind;
use crate::task::resolver::{TargetQuery, query_target_states};
use crate::task::service::TaskService;
use crate::task::submitter::{SubmitRequest, TaskSubmitter};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub submitter: Arc<TaskSubmitter>,
    pub config: EngineConfig,
}

/// Build the Axum router with task REST and event feed routes.
pub fn task_routes(
    service: Arc<TaskService>,
    submitter: Arc<TaskSubmitter>,
    config: EngineConfig,
) -> Router {
    let state = AppState { service, submitter, config };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/dismiss-failed", post(dismiss_failed))
        .route("/api/tasks/{id}", get(task_snapshot))
        .route("/api/tasks/{id}", delete(cancel_task))
        .route("/api/task-target-states", post(target_states))
        .route("/ws/events", get(ws_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "genlane"
    }))
}

// ── Submission ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    kind: TaskKind,
    target_type: String,
    target_id: String,
    #[serde(default)]
    payload: Value,
    dedupe_key: Option<String>,
    user_id: String,
    project_id: String,
    episode_id: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    cost: i64,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> impl IntoResponse {
    let request = SubmitRequest {
        kind: body.kind,
        target_type: body.target_type,
        target_id: body.target_id,
        payload: body.payload,
        dedupe_key: body.dedupe_key,
        user_id: body.user_id,
        project_id: body.project_id,
        episode_id: body.episode_id,
        priority: body.priority,
        cost: body.cost,
    };

    match state.submitter.submit(request).await {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(json!({"taskId": outcome.task_id, "deduped": outcome.deduped})),
        ),
        Err(e) => submit_error_response(e),
    }
}

fn submit_error_response(error: Error) -> (StatusCode, Json<Value>) {
    let (status, code) = match &error {
        Error::Submit(SubmitError::InvalidParams(_)) => {
            (StatusCode::BAD_REQUEST, "INVALID_PARAMS")
        }
        Error::Submit(SubmitError::InsufficientBalance(_)) => {
            (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_BALANCE")
        }
        Error::Submit(SubmitError::EnqueueFailed { .. }) => {
            (StatusCode::BAD_GATEWAY, "ENQUEUE_FAILED")
        }
        Error::Submit(SubmitError::BillingCompensationFailed { .. }) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "BILLING_COMPENSATION_FAILED")
        }
        Error::Queue(_) => (StatusCode::BAD_GATEWAY, "QUEUE_ERROR"),
        Error::Billing(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BILLING_ERROR"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    warn!(code, error = %error, "Submission rejected");
    (status, Json(json!({"error": error.to_string(), "code": code})))
}

// ── Snapshot ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SnapshotQuery {
    include_events: Option<String>,
}

impl SnapshotQuery {
    fn wants_events(&self) -> bool {
        matches!(self.include_events.as_deref(), Some("1") | Some("true"))
    }
}

async fn task_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid task ID"})),
        );
    };

    let task = match state.service.store().get_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Task not found"})),
            );
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Snapshot read failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Snapshot read failed"})),
            );
        }
    };

    if !query.wants_events() {
        return (StatusCode::OK, Json(json!({"task": task})));
    }

    // Event history with ledger reconciliation: a terminal row always yields
    // a terminal event at the end, even if the log is missing one.
    match state.service.publisher().list_task_events(&task).await {
        Ok(events) => (StatusCode::OK, Json(json!({"task": task, "events": events}))),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Event history read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Event history read failed"})),
            )
        }
    }
}

// ── Cancel / dismiss ────────────────────────────────────────────────

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid task ID"})),
        );
    };

    match state.service.cancel_task(task_id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "cancelled"}))),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "Task not found or already terminal"})),
        ),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Cancel failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Cancel failed"})),
            )
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DismissBody {
    user_id: String,
    task_ids: Vec<Uuid>,
}

async fn dismiss_failed(
    State(state): State<AppState>,
    Json(body): Json<DismissBody>,
) -> impl IntoResponse {
    match state.service.dismiss_failed_tasks(&body.user_id, &body.task_ids).await {
        Ok(dismissed) => (StatusCode::OK, Json(json!({"dismissed": dismissed}))),
        Err(e) => {
            warn!(error = %e, "Dismiss failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Dismiss failed"})),
            )
        }
    }
}

// ── Target states ───────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetStatesBody {
    project_id: String,
    user_id: String,
    targets: Vec<TargetQuery>,
}

async fn target_states(
    State(state): State<AppState>,
    Json(body): Json<TargetStatesBody>,
) -> impl IntoResponse {
    let result = query_target_states(
        state.service.store().as_ref(),
        &body.project_id,
        &body.user_id,
        &body.targets,
        state.config.resolver_batch_size,
    )
    .await;

    match result {
        Ok(states) => (StatusCode::OK, Json(json!({"states": states}))),
        Err(e) => {
            warn!(error = %e, "Target state query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Target state query failed"})),
            )
        }
    }
}

// ── WebSocket event feed ────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedScope {
    project_id: String,
    episode_id: Option<String>,
}

impl FeedScope {
    fn matches(&self, event: &TaskEvent) -> bool {
        if event.project_id != self.project_id {
            return false;
        }
        match (&self.episode_id, &event.episode_id) {
            (Some(scope), Some(event_episode)) => scope == event_episode,
            // Scoped to an episode: project-wide events still flow.
            (Some(_), None) => true,
            (None, _) => true,
        }
    }
}

async fn ws_events(
    ws: WebSocketUpgrade,
    Query(scope): Query<FeedScope>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!(project_id = %scope.project_id, "Event feed client connecting");
    ws.on_upgrade(move |socket| handle_feed_socket(socket, state.service, scope))
}

async fn handle_feed_socket(mut socket: WebSocket, service: Arc<TaskService>, scope: FeedScope) {
    let mut rx = service.publisher().subscribe();
    info!(project_id = %scope.project_id, "Event feed client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !scope.matches(&event) {
                            continue;
                        }
                        if let Ok(text) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(text.into())).await.is_err() {
                                debug!("Feed client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Tell the client to re-sync from snapshots rather
                        // than silently dropping events.
                        warn!(missed = n, "Feed client lagged behind broadcast");
                        let notice = json!({"type": "lagged", "missed": n});
                        if socket.send(Message::Text(notice.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Event broadcast closed");
                        break;
                    }
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event feed client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Event feed socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
