use std::sync::Arc;

use async_trait::async_trait;
use genlane::api::task_routes;
use genlane::billing::InMemoryBillingLedger;
use genlane::config::EngineConfig;
use genlane::events::{ProgressPublisher, StreamBody, StreamPayload};
use genlane::queue::{
    HandlerFailure, InProcessLane, Job, Lane, LaneQueue, ProgressReporter, QueueRouter, TaskHandler,
};
use genlane::store::{LibSqlStore, TaskStore};
use genlane::task::model::TaskKind;
use genlane::task::service::{TaskService, TaskWorker};
use genlane::task::submitter::TaskSubmitter;
use genlane::watchdog::Watchdog;

/// Stand-in handler for local runs: walks a few stages, streams a line of
/// text, and completes with an echo of the payload. Real deployments
/// register their own generation handlers on the worker.
struct SimulatedHandler;

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn run(
        &self,
        job: &Job,
        reporter: &dyn ProgressReporter,
    ) -> Result<Option<serde_json::Value>, HandlerFailure> {
        for (progress, stage) in [(25u8, "preparing"), (60, "generating"), (90, "finalizing")] {
            reporter
                .progress(job, progress, Some(serde_json::json!({"stage": stage})))
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        reporter
            .stream(
                job,
                StreamPayload {
                    step_id: "simulate".to_string(),
                    step_attempt: None,
                    stream: StreamBody {
                        kind: "text".to_string(),
                        lane: "text".to_string(),
                        seq: 1,
                        delta: "simulated output".to_string(),
                    },
                },
            )
            .await;
        Ok(Some(serde_json::json!({"echo": job.payload, "simulated": true})))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();

    let port: u16 = std::env::var("GENLANE_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let db_path =
        std::env::var("GENLANE_DB_PATH").unwrap_or_else(|_| "./data/genlane.db".to_string());

    eprintln!("genlane v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/tasks", port);
    eprintln!("   Feed: ws://0.0.0.0:{}/ws/events", port);
    eprintln!("   Database: {}", db_path);

    // ── Database ────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> =
        Arc::new(LibSqlStore::new_local(std::path::Path::new(&db_path)).await?);

    // ── Billing ─────────────────────────────────────────────────────
    let demo_balance: i64 = std::env::var("GENLANE_DEMO_BALANCE")
        .unwrap_or_else(|_| "10000".to_string())
        .parse()
        .unwrap_or(10000);
    let billing = Arc::new(InMemoryBillingLedger::new().with_balance("demo", demo_balance));

    // ── Publisher (used by the worker, lanes, and the API feed) ─────
    let publisher = Arc::new(ProgressPublisher::new(
        store.clone(),
        config.event_channel_capacity,
        config.replay_events_limit,
    ));

    // Router is built after the lanes, but the service the worker needs is
    // built first with an empty router; lanes only need the worker.
    let bootstrap_router = Arc::new(QueueRouter::new(vec![]));
    let worker_service = Arc::new(TaskService::new(
        store.clone(),
        bootstrap_router,
        billing.clone(),
        publisher.clone(),
    ));

    let mut worker = TaskWorker::new(worker_service);
    for kind in [
        TaskKind::ImageCharacter,
        TaskKind::ImageLocation,
        TaskKind::ImagePanel,
        TaskKind::VideoShot,
        TaskKind::VoiceLine,
        TaskKind::TextGeneration,
        TaskKind::TextAnalysis,
    ] {
        worker = worker.register(kind, Arc::new(SimulatedHandler));
    }
    let worker = Arc::new(worker);

    // ── Lanes ───────────────────────────────────────────────────────
    let lanes: Vec<Arc<dyn LaneQueue>> = Lane::ALL
        .iter()
        .map(|&lane| {
            InProcessLane::start(lane, config.lane_concurrency, worker.clone())
                as Arc<dyn LaneQueue>
        })
        .collect();
    let router = Arc::new(QueueRouter::new(lanes));
    eprintln!("   Lanes: image, video, voice, text ({} workers each)", config.lane_concurrency);

    // ── Service / submitter / watchdog ──────────────────────────────
    let service = Arc::new(TaskService::new(store, router, billing, publisher));
    let submitter = Arc::new(TaskSubmitter::new(service.clone()));

    let watchdog = Watchdog::new(service.clone(), config.clone());
    let _watchdog_handle = watchdog.spawn();

    // ── HTTP/WS server ──────────────────────────────────────────────
    let app = task_routes(service, submitter, config);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "genlane server started");
    axum::serve(listener, app).await?;

    Ok(())
}
