//! HTTP surface: replication trigger, job trigger, liveness.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tracing::error;

use giftwell_core::JobId;
use giftwell_jobs::EngineError;

use crate::services::AppState;

/// Build the router with all routes and shared state.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync/run", post(run_sync))
        .route("/jobs/run", post(run_jobs))
        .layer(Extension(state))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Replication trigger
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SyncRequest {
    #[serde(rename = "batchSize")]
    batch_size: Option<u32>,
    #[serde(default)]
    reconcile: bool,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    success: bool,
    processed: usize,
    failed: usize,
    errors: Vec<String>,
    timestamp: DateTime<Utc>,
}

impl SyncResponse {
    fn systemic_failure(error: String) -> Self {
        Self {
            success: false,
            processed: 0,
            failed: 0,
            errors: vec![error],
            timestamp: Utc::now(),
        }
    }
}

/// `POST /sync/run` — one replication batch, or a reconciliation sweep
/// when `reconcile` is set.
async fn run_sync(
    Extension(state): Extension<AppState>,
    Json(request): Json<SyncRequest>,
) -> impl IntoResponse {
    let limit = request.batch_size.unwrap_or(state.default_batch_size) as usize;

    // Store-backed batch work can block; keep it off the async workers.
    let outcome = if request.reconcile {
        let sweep = state.sweep.clone();
        tokio::task::spawn_blocking(move || sweep.reconcile().map_err(|e| e.to_string())).await
    } else {
        let worker = state.worker.clone();
        tokio::task::spawn_blocking(move || worker.process_batch(limit).map_err(|e| e.to_string()))
            .await
    };

    match outcome {
        Ok(Ok(report)) => (
            StatusCode::OK,
            Json(SyncResponse {
                success: true,
                processed: report.processed,
                failed: report.failed,
                errors: report.errors,
                timestamp: Utc::now(),
            }),
        ),
        Ok(Err(err)) => {
            error!(error = %err, "replication invocation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SyncResponse::systemic_failure(err)),
            )
        }
        Err(join_err) => {
            error!(error = %join_err, "replication task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SyncResponse::systemic_failure(join_err.to_string())),
            )
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job trigger
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JobAction {
    StartRegeneration,
    JobStatus,
    RetryFailed,
    GetStats,
    StartTest,
    ReapAbandoned,
}

#[derive(Debug, Deserialize)]
struct JobRequest {
    action: JobAction,
    #[serde(default)]
    force_regen: bool,
    #[serde(rename = "jobId")]
    job_id: Option<String>,
}

/// `POST /jobs/run` — start/inspect/retry regeneration jobs.
///
/// Start actions answer with accepted semantics: the job continues after
/// the response is sent.
async fn run_jobs(
    Extension(state): Extension<AppState>,
    Json(request): Json<JobRequest>,
) -> impl IntoResponse {
    match request.action {
        JobAction::StartRegeneration => {
            match state.engine.start(request.force_regen) {
                Ok(job_id) => accepted(job_id),
                Err(err) => engine_error(err),
            }
        }
        JobAction::StartTest => match state.engine.start_test() {
            Ok(job_id) => accepted(job_id),
            Err(err) => engine_error(err),
        },
        JobAction::JobStatus => {
            let Some(job_id) = parse_job_id(&request) else {
                return bad_request("job_status requires a valid jobId");
            };
            match state.engine.status(job_id) {
                Ok(Some(job)) => (StatusCode::OK, Json(json!({ "success": true, "job": job }))),
                Ok(None) => (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "success": false, "error": format!("job not found: {job_id}") })),
                ),
                Err(err) => engine_error(err),
            }
        }
        JobAction::RetryFailed => {
            let Some(job_id) = parse_job_id(&request) else {
                return bad_request("retry_failed requires a valid jobId");
            };
            match state.engine.retry_failed(job_id) {
                Ok(new_job_id) => accepted(new_job_id),
                Err(err) => engine_error(err),
            }
        }
        JobAction::GetStats => get_stats(&state),
        JobAction::ReapAbandoned => {
            // Lease matches the job heartbeat cadence with generous slack.
            match state.engine.reap_abandoned(Duration::from_secs(300)) {
                Ok(reaped) => (
                    StatusCode::OK,
                    Json(json!({ "success": true, "reaped": reaped })),
                ),
                Err(err) => engine_error(err),
            }
        }
    }
}

fn get_stats(state: &AppState) -> (StatusCode, Json<serde_json::Value>) {
    let depth = state.outbox.depth();
    let poisoned = state.outbox.list_poisoned(100);
    let jobs = state.jobs.counts();

    match (depth, poisoned, jobs) {
        (Ok(depth), Ok(poisoned), Ok(jobs)) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "outbox_depth": depth,
                "poisoned_entries": poisoned.len(),
                "jobs": jobs,
                "counters": state.metrics.snapshot(),
            })),
        ),
        (depth, poisoned, jobs) => {
            let err = [
                depth.err().map(|e| e.to_string()),
                poisoned.err().map(|e| e.to_string()),
                jobs.err().map(|e| e.to_string()),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("; ");
            error!(error = %err, "stats aggregation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": err })),
            )
        }
    }
}

fn parse_job_id(request: &JobRequest) -> Option<JobId> {
    request
        .job_id
        .as_deref()
        .and_then(|raw| JobId::from_str(raw).ok())
}

fn accepted(job_id: JobId) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "jobId": job_id })),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message })),
    )
}

fn engine_error(err: EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::NotRetryable(_) | EngineError::NothingToRetry(_) => StatusCode::CONFLICT,
        EngineError::Setup(_) | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "job invocation failed");
    }
    (
        status,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
