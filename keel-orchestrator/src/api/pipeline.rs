//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline definitions and the revision webhook.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::domain::revision::Revision;
use keel_core::dto::pipeline::{CreatePipeline, PipelineSummary};
use keel_core::dto::trigger::{TriggerOutcome, TriggerRevision};

use crate::api::error::{ApiError, ApiResult};
use crate::pipelines::CatalogError;
use crate::scheduler::Scheduler;

/// POST /pipeline/create
/// Register a definition as the next version of its pipeline
pub async fn create_pipeline(
    State(scheduler): State<Arc<Scheduler>>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<Json<PipelineDefinition>> {
    tracing::info!("Registering pipeline: {}", req.name);

    let definition = scheduler
        .register_pipeline(req)
        .await
        .map_err(|e| match e {
            CatalogError::Validation(msg) => ApiError::BadRequest(msg),
            CatalogError::Store(err) => err.into(),
        })?;

    Ok(Json(definition))
}

/// GET /pipeline/list
pub async fn list_pipelines(
    State(scheduler): State<Arc<Scheduler>>,
) -> ApiResult<Json<Vec<PipelineSummary>>> {
    tracing::debug!("Listing pipelines");

    let pipelines = scheduler
        .catalog()
        .list()
        .await
        .into_iter()
        .map(PipelineSummary::from)
        .collect();

    Ok(Json(pipelines))
}

/// GET /pipeline/{name}
/// Latest version of a pipeline
pub async fn get_pipeline(
    State(scheduler): State<Arc<Scheduler>>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineDefinition>> {
    tracing::debug!("Getting pipeline: {}", name);

    scheduler
        .catalog()
        .latest(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Pipeline {} not found", name)))
}

/// POST /pipeline/{name}/trigger
/// Webhook: a revision is available for the pipeline
pub async fn trigger_pipeline(
    State(scheduler): State<Arc<Scheduler>>,
    Path(name): Path<String>,
    Json(req): Json<TriggerRevision>,
) -> ApiResult<Json<TriggerOutcome>> {
    if req.revision.trim().is_empty() {
        return Err(ApiError::BadRequest("revision cannot be empty".to_string()));
    }
    if !Revision::is_valid_id(&req.revision) {
        return Err(ApiError::BadRequest(format!(
            "invalid revision id '{}'",
            req.revision
        )));
    }
    if let Some(parent) = &req.parent_id {
        if !Revision::is_valid_id(parent) {
            return Err(ApiError::BadRequest(format!("invalid parent id '{parent}'")));
        }
    }

    tracing::info!("Revision {} announced for pipeline {}", req.revision, name);

    let revision = Revision::new(req.revision, req.parent_id);
    let outcome = scheduler.on_revision(&name, revision).await?;

    Ok(Json(outcome))
}
