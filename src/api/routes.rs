//! REST + WebSocket endpoints for job control and log streaming.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::engine::job::{JobRecord, JsonMap};
use crate::engine::loghub::LogStreamEvent;
use crate::engine::scheduler::{JobScheduler, StartOptions};
use crate::error::{Error, ModuleError};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    /// Keepalive interval for live log streams.
    pub keepalive: Duration,
}

/// Build the Axum router for the engine API.
pub fn api_routes(scheduler: Arc<JobScheduler>, keepalive: Duration) -> Router {
    let state = AppState {
        scheduler,
        keepalive,
    };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/modules", get(list_modules))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/stop", post(stop_job))
        .route("/jobs/{id}/logs", get(get_logs))
        .route("/jobs/{id}/results", get(get_results))
        .route("/jobs/{id}/logs/stream", get(stream_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Request/response shapes ─────────────────────────────────────────

/// Request body for creating a job.
#[derive(Debug, Deserialize)]
pub struct JobCreateRequest {
    pub module_id: String,
    #[serde(default)]
    pub inputs: JsonMap,
    #[serde(default)]
    pub settings: JsonMap,
    #[serde(default)]
    pub max_duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
    after_seq: Option<i64>,
}

fn default_log_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    #[serde(default = "default_result_limit")]
    limit: usize,
}

fn default_result_limit() -> usize {
    1000
}

/// Map an engine error to an HTTP response.
fn error_response(err: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        Error::Module(ModuleError::NotFound { .. })
        | Error::Module(ModuleError::InvalidInputs { .. })
        | Error::Job(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"detail": err.to_string()})))
}

fn not_found(detail: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"detail": detail})),
    )
}

/// Resolve a path id (full or prefix) to a job record.
async fn resolve_job(state: &AppState, id: &str) -> Option<JobRecord> {
    state.scheduler.store().find_job(id).await.ok().flatten()
}

// ── Handlers ────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskmill"
    }))
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.status().await)
}

async fn list_modules(State(state): State<AppState>) -> impl IntoResponse {
    let modules = state.scheduler.modules().list().await;
    Json(serde_json::json!({"modules": modules}))
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobCreateRequest>,
) -> impl IntoResponse {
    let options = StartOptions {
        settings: request.settings,
        checkpoint: None,
        max_duration: request.max_duration,
    };

    match state
        .scheduler
        .start_job(&request.module_id, request.inputs, options)
        .await
    {
        Ok(job_id) => (
            StatusCode::OK,
            Json(serde_json::json!({"id": job_id, "status": "pending"})),
        ),
        Err(e) => error_response(e),
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> impl IntoResponse {
    let status = query
        .status
        .as_deref()
        .and_then(crate::engine::job::JobStatus::parse);
    match state.scheduler.store().list_jobs(status).await {
        Ok(jobs) => (StatusCode::OK, Json(serde_json::json!({"jobs": jobs}))),
        Err(e) => error_response(e.into()),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match resolve_job(&state, &id).await {
        Some(job) => (StatusCode::OK, Json(serde_json::to_value(job).unwrap_or_default())),
        None => {
            let (status, body) = not_found("Job not found");
            (status, body)
        }
    }
}

async fn stop_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = resolve_job(&state, &id).await else {
        return not_found("Job not found");
    };

    if state.scheduler.stop_job(job.id).await {
        info!(job_id = %job.id, "Job stopped via API");
        (
            StatusCode::OK,
            Json(serde_json::json!({"status": "stopped", "job_id": job.id})),
        )
    } else {
        not_found("Job not found or not running")
    }
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let Some(job) = resolve_job(&state, &id).await else {
        return not_found("Job not found");
    };

    match state
        .scheduler
        .store()
        .list_logs(job.id, query.limit, query.after_seq)
        .await
    {
        Ok(logs) => (StatusCode::OK, Json(serde_json::json!({"logs": logs}))),
        Err(e) => error_response(e.into()),
    }
}

async fn get_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> impl IntoResponse {
    let Some(job) = resolve_job(&state, &id).await else {
        return not_found("Job not found");
    };

    let store = state.scheduler.store();
    match store.list_results(job.id, query.limit).await {
        Ok(results) => {
            let total = store.result_count(job.id).await.unwrap_or(results.len() as i64);
            (
                StatusCode::OK,
                Json(serde_json::json!({"results": results, "total": total})),
            )
        }
        Err(e) => error_response(e.into()),
    }
}

// ── Log streaming ───────────────────────────────────────────────────

async fn stream_logs(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_log_socket(socket, state, id))
}

async fn handle_log_socket(mut socket: WebSocket, state: AppState, id: String) {
    let Some(job) = resolve_job(&state, &id).await else {
        // 4004: job not found (application close code).
        let _ = socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 4004,
                reason: "Job not found".into(),
            })))
            .await;
        return;
    };

    info!(job_id = %job.id, "Log stream client connected");
    let mut stream = state.scheduler.subscribe_logs(job.id).await;
    let mut keepalive = tokio::time::interval(state.keepalive);
    keepalive.reset();

    loop {
        tokio::select! {
            event = stream.next() => {
                let payload = match event {
                    Some(LogStreamEvent::Entry(entry)) => serde_json::to_string(&entry).ok(),
                    Some(LogStreamEvent::Dropped { count }) => {
                        warn!(job_id = %job.id, count, "Log stream subscriber lagged");
                        serde_json::to_string(
                            &serde_json::json!({"type": "dropped", "count": count}),
                        )
                        .ok()
                    }
                    Some(LogStreamEvent::Closed) | None => {
                        let _ = socket
                            .send(Message::Text("{\"type\":\"closed\"}".into()))
                            .await;
                        break;
                    }
                };
                if let Some(json) = payload {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        debug!(job_id = %job.id, "Client disconnected during send");
                        break;
                    }
                }
            }

            _ = keepalive.tick() => {
                if socket
                    .send(Message::Text("{\"type\":\"ping\"}".into()))
                    .await
                    .is_err()
                {
                    break;
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
                        info!(job_id = %job.id, "Log stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(job_id = %job.id, error = %e, "Log stream socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
