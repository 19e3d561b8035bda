use crate::config::CoordinatorConfig;
use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use market_core::{
    aggregate::{self, SubmitOutcome},
    dispatch,
    models::{TaskStatus, TaskSummary, WorkerScore},
    reaper,
    store::DbStats,
    tasks::{self, NewTask},
    workers, Clock, Error as CoreError, Store, SystemClock,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

#[derive(Clone)]
struct AppState {
    store: Store,
    cfg: CoordinatorConfig,
    clock: Arc<dyn Clock>,
}

pub struct CoordinatorServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl CoordinatorServer {
    pub async fn start(
        store: Store,
        cfg: CoordinatorConfig,
        bind: SocketAddr,
        clock: Arc<dyn Clock>,
        enable_reaper: bool,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind coordinator to {bind}"))?;
        let addr = listener.local_addr().context("coordinator local_addr")?;

        let state = Arc::new(AppState { store, cfg, clock });
        let app = build_router(state.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_coordinator(
            listener,
            app,
            state,
            shutdown_rx,
            enable_reaper,
        ));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join coordinator task")??;
        Ok(())
    }
}

/// Run until ctrl-c, for the `serve` subcommand.
pub async fn run(cfg: &CoordinatorConfig) -> anyhow::Result<()> {
    let store = Store::connect(&cfg.database_url)
        .await
        .context("connect coordinator db")?;
    store.migrate().await.context("migrate coordinator db")?;

    let bind: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("parse COORDINATOR_BIND={}", cfg.bind))?;

    let server =
        CoordinatorServer::start(store, cfg.clone(), bind, Arc::new(SystemClock), true).await?;
    tracing::info!(addr = %server.addr, "coordinator listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("coordinator shutting down");
    server.shutdown().await?;
    Ok(())
}

async fn run_coordinator(
    listener: TcpListener,
    app: Router,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
    enable_reaper: bool,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<anyhow::Result<()>>>::new();
    if enable_reaper {
        bg.push(tokio::spawn(reaper_loop(state.clone(), shutdown_rx.clone())));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    tokio::select! {
        res = server => {
            res.context("coordinator serve")?;
        }
        _ = wait_shutdown(&mut shutdown_rx) => {}
    }

    for h in bg {
        let _ = h.await;
    }

    Ok(())
}

async fn wait_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Background sweep: stale workers first, then abandoned leases. Sweep
/// failures are logged and the loop stays alive.
async fn reaper_loop(
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let interval = Duration::from_secs(state.cfg.requeue_sweep_secs);

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        match reaper::sweep(
            &state.store,
            state.clock.as_ref(),
            state.cfg.heartbeat_ttl(),
        )
        .await
        {
            Ok(outcome) if outcome.stale_workers > 0 || outcome.tasks_touched() > 0 => {
                tracing::info!(
                    event = "coordinator.reaper.sweep",
                    stale_workers = outcome.stale_workers,
                    requeued = outcome.requeued,
                    failed = outcome.failed,
                    "sweep reclaimed work"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "reaper sweep error");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workers/register", post(workers_register))
        .route("/workers/heartbeat", post(workers_heartbeat))
        .route("/workers/submit", post(workers_submit))
        .route("/tasks", post(tasks_create).get(tasks_list))
        .route("/tasks/next", post(tasks_next))
        .route("/tasks/:task_id", get(tasks_get))
        .route("/ops/requeue-stale", post(ops_requeue_stale))
        .route("/ops/reset", post(ops_reset))
        .route("/leaderboard", get(leaderboard))
        .route("/db/stats", get(db_stats))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    worker_id: String,
    capabilities_json: Option<String>,
}

async fn workers_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let capabilities = match req.capabilities_json.as_deref() {
        None => None,
        Some(raw) => Some(serde_json::from_str::<Vec<String>>(raw).map_err(|_| {
            ApiError::bad_request("capabilities_json must be a JSON array of strings")
        })?),
    };

    workers::register(
        &state.store,
        state.clock.as_ref(),
        &req.worker_id,
        capabilities.as_deref(),
    )
    .await?;

    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    worker_id: String,
}

async fn workers_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let ts = workers::heartbeat(
        &state.store,
        state.clock.as_ref(),
        &req.worker_id,
        state.cfg.lease(),
    )
    .await?;

    Ok(Json(serde_json::json!({ "ok": true, "ts": ts.to_rfc3339() })))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    text: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    required_submissions: Option<i64>,
    max_attempts: Option<i64>,
}

async fn tasks_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.required_submissions.is_some_and(|n| n < 1) {
        return Err(ApiError::bad_request("required_submissions must be positive"));
    }
    if req.max_attempts.is_some_and(|n| n < 1) {
        return Err(ApiError::bad_request("max_attempts must be positive"));
    }

    let task_id = tasks::create(
        &state.store,
        state.clock.as_ref(),
        state.cfg.task_defaults(),
        NewTask {
            text: req.text,
            kind: req.kind,
            required_submissions: req.required_submissions,
            max_attempts: req.max_attempts,
        },
    )
    .await?;

    Ok(Json(serde_json::json!({ "task_id": task_id })))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
}

async fn tasks_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<TaskSummary>>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .map_err(|_| ApiError::bad_request("unknown status filter"))?,
        ),
    };

    Ok(Json(tasks::list(&state.store, status).await?))
}

async fn tasks_get(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let (task, submissions) = tasks::get(&state.store, &task_id).await?;
    Ok(Json(
        serde_json::json!({ "task": task, "submissions": submissions }),
    ))
}

#[derive(Debug, Deserialize)]
struct NextTaskRequest {
    worker_id: String,
}

async fn tasks_next(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NextTaskRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let claimed = dispatch::next_task(
        &state.store,
        state.clock.as_ref(),
        &req.worker_id,
        state.cfg.lease(),
    )
    .await?;

    let body = match claimed {
        Some(claimed) => serde_json::json!({ "task_id": claimed.task_id, "text": claimed.text }),
        None => serde_json::json!({ "task_id": null, "text": null }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    worker_id: String,
    task_id: String,
    label: String,
    confidence: f64,
}

async fn workers_submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !(0.0..=1.0).contains(&req.confidence) {
        return Err(ApiError::bad_request("confidence must be within [0, 1]"));
    }

    let outcome = aggregate::submit(
        &state.store,
        state.clock.as_ref(),
        &req.worker_id,
        &req.task_id,
        &req.label,
        req.confidence,
    )
    .await?;

    let body = match outcome {
        SubmitOutcome::Duplicate => serde_json::json!({ "ok": true, "duplicate": true }),
        SubmitOutcome::Accepted { .. } => serde_json::json!({ "ok": true }),
    };
    Ok(Json(body))
}

async fn ops_requeue_stale(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let requeued = reaper::requeue_expired(
        &state.store,
        state.clock.as_ref(),
        state.cfg.heartbeat_ttl(),
    )
    .await?;

    Ok(Json(serde_json::json!({ "requeued": requeued })))
}

async fn ops_reset(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    state.store.reset().await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn leaderboard(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<WorkerScore>>> {
    Ok(Json(state.store.leaderboard().await?))
}

async fn db_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<DbStats>> {
    let now = state.clock.now();
    Ok(Json(state.store.stats(now, state.cfg.heartbeat_ttl()).await?))
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(error = %err, "coordinator internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TaskNotFound(id) => Self::not_found(format!("task not found: {id}")),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
