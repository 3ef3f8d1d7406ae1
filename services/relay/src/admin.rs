//! Admin HTTP API
//!
//! Job submission and inspection, resource status, health and metrics. Every
//! response body is JSON except `/metrics`, which is Prometheus text.
//!
//! Endpoints:
//! - GET    /health                        rotator + dispatcher summary
//! - GET    /metrics                       Prometheus exposition
//! - POST   /jobs                          submit `{owner, payload_ref, priority?}`
//! - GET    /jobs/{id}                     job snapshot
//! - DELETE /jobs/{id}                     cancel a Pending/Processing job
//! - POST   /jobs/cleanup                  drop terminal jobs older than `max_age_secs`
//! - GET    /owners/{owner}/jobs           every job of one owner
//! - GET    /stats                         queue statistics
//! - GET    /resources                     per-resource health
//! - POST   /resources/rotate              name the resource the next acquire would pick
//! - POST   /resources/{name}/reconnect    drop a resource's session and stored token

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dispatcher::{Dispatcher, JobId, Processor};
use metrics_exporter_prometheus::PrometheusHandle;
use rotator::Rotator;
use serde::Deserialize;
use tracing::info;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    dispatcher: Dispatcher,
    rotator: Arc<Rotator>,
    processor: Arc<dyn Processor>,
    prometheus: PrometheusHandle,
}

impl AdminState {
    pub fn new(
        dispatcher: Dispatcher,
        rotator: Arc<Rotator>,
        processor: Arc<dyn Processor>,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            dispatcher,
            rotator,
            processor,
            prometheus,
        }
    }
}

/// Build the admin router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
pub fn build_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/jobs", post(submit_job))
        .route("/jobs/cleanup", post(cleanup_jobs))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/owners/{owner}/jobs", get(owner_jobs))
        .route("/stats", get(stats))
        .route("/resources", get(list_resources))
        .route("/resources/rotate", post(rotate))
        .route("/resources/{name}/reconnect", post(reconnect))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

/// GET /health: 200 while at least one resource is usable and the worker
/// pool runs, 503 otherwise.
async fn health(State(state): State<AdminState>) -> Response {
    let rotator = state.rotator.health().await;
    let running = state.dispatcher.is_running();
    let queue = state.dispatcher.stats().await;

    let rotator_status = rotator
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unhealthy");
    let status = match (running, rotator_status) {
        (false, _) | (_, "unhealthy") => "unhealthy",
        (true, "healthy") => "healthy",
        _ => "degraded",
    };
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    json_response(
        code,
        serde_json::json!({
            "status": status,
            "dispatcher": {
                "running": running,
                "queue_depth": queue.queue_depth,
                "active_workers": queue.active_workers,
            },
            "rotator": rotator,
        }),
    )
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_text(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Request body for job submission.
#[derive(Deserialize)]
struct SubmitRequest {
    owner: String,
    payload_ref: String,
    #[serde(default)]
    priority: i32,
}

/// POST /jobs: 202 with the job id, 429 when the owner is at its limit.
async fn submit_job(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<SubmitRequest>,
) -> Response {
    if body.owner.is_empty() || body.payload_ref.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "owner and payload_ref must be non-empty",
        );
    }

    match state
        .dispatcher
        .submit(
            &body.owner,
            &body.payload_ref,
            body.priority,
            state.processor.clone(),
        )
        .await
    {
        Ok(job_id) => json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({ "job_id": job_id }),
        ),
        Err(e @ dispatcher::Error::AdmissionRejected { .. }) => {
            error_response(StatusCode::TOO_MANY_REQUESTS, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /jobs/{id}
async fn get_job(State(state): State<AdminState>, Path(id): Path<JobId>) -> Response {
    match state.dispatcher.require_job(id).await {
        Ok(job) => json_response(StatusCode::OK, serde_json::json!(job)),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// DELETE /jobs/{id}: 404 for unknown jobs, 409 for jobs already terminal.
async fn cancel_job(State(state): State<AdminState>, Path(id): Path<JobId>) -> Response {
    if state.dispatcher.cancel(id).await {
        return json_response(
            StatusCode::OK,
            serde_json::json!({ "job_id": id, "cancelled": true }),
        );
    }
    match state.dispatcher.get_job(id).await {
        Some(job) => error_response(
            StatusCode::CONFLICT,
            format!("job {id} is already {}", job.status),
        ),
        None => error_response(StatusCode::NOT_FOUND, format!("job not found: {id}")),
    }
}

/// Request body for cleanup.
#[derive(Deserialize)]
struct CleanupRequest {
    max_age_secs: u64,
}

/// POST /jobs/cleanup
async fn cleanup_jobs(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CleanupRequest>,
) -> Response {
    let removed = state
        .dispatcher
        .cleanup_old(Duration::from_secs(body.max_age_secs))
        .await;
    json_response(StatusCode::OK, serde_json::json!({ "removed": removed }))
}

/// GET /owners/{owner}/jobs
async fn owner_jobs(State(state): State<AdminState>, Path(owner): Path<String>) -> Response {
    let jobs = state.dispatcher.get_owner_jobs(&owner).await;
    let inflight = state.dispatcher.inflight(&owner).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "owner": owner,
            "inflight": inflight,
            "limit": state.dispatcher.config().per_owner_limit,
            "jobs": jobs,
        }),
    )
}

/// GET /stats
async fn stats(State(state): State<AdminState>) -> Response {
    let stats = state.dispatcher.stats().await;
    json_response(StatusCode::OK, serde_json::json!(stats))
}

/// GET /resources: per-resource health, never exposes tokens.
async fn list_resources(State(state): State<AdminState>) -> Response {
    let resources = state.rotator.stats().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "available": state.rotator.get_available_count().await,
            "total": state.rotator.get_total_count().await,
            "resources": resources,
        }),
    )
}

/// POST /resources/rotate
async fn rotate(State(state): State<AdminState>) -> Response {
    let next = state.rotator.force_rotate().await;
    json_response(StatusCode::OK, serde_json::json!({ "next": next }))
}

/// POST /resources/{name}/reconnect
async fn reconnect(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    match state.rotator.reconnect(&name).await {
        Ok(()) => {
            info!(resource = name, "reconnect requested via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "resource": name, "reconnect": "scheduled" }),
            )
        }
        Err(e @ rotator::Error::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
