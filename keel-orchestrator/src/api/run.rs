//! Run API Handlers
//!
//! HTTP endpoints for run history, logs and aborts.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use keel_core::domain::log::LogEntry;
use keel_core::domain::run::{Run, RunId};
use keel_core::dto::run::RunSummary;

use crate::api::error::ApiResult;
use crate::scheduler::Scheduler;

/// GET /run/{id}
pub async fn get_run(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<RunId>,
) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    Ok(Json(scheduler.run(id).await?))
}

/// GET /run/pipeline/{name}
/// Run history of a pipeline, newest first
pub async fn list_runs_by_pipeline(
    State(scheduler): State<Arc<Scheduler>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    tracing::debug!("Listing runs for pipeline: {}", name);

    let runs = scheduler.runs(&name).await?;
    Ok(Json(runs.into_iter().map(RunSummary::from).collect()))
}

/// POST /run/{id}/abort
pub async fn abort_run(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<RunId>,
) -> ApiResult<StatusCode> {
    tracing::info!("Aborting run: {}", id);

    scheduler.abort(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /run/{id}/logs
pub async fn get_run_logs(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<RunId>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    tracing::debug!("Getting logs for run: {}", id);

    Ok(Json(scheduler.run_logs(id).await?))
}
