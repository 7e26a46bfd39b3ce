//! Slot API Handlers
//!
//! HTTP endpoints for deployment slots.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use keel_core::domain::slot::DeploymentSlot;

use crate::api::error::{ApiError, ApiResult};
use crate::deploy::RollbackError;
use crate::scheduler::Scheduler;

/// GET /slot/list
pub async fn list_slots(State(scheduler): State<Arc<Scheduler>>) -> Json<Vec<DeploymentSlot>> {
    Json(scheduler.deployer().slots().await)
}

/// GET /slot/{id}
pub async fn get_slot(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentSlot>> {
    scheduler
        .deployer()
        .slot(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Slot {} not found", id)))
}

/// POST /slot/{id}/rollback
/// Swap the slot back to the artifact it ran before
pub async fn rollback_slot(
    State(scheduler): State<Arc<Scheduler>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentSlot>> {
    tracing::info!("Rolling back slot: {}", id);

    let slot = scheduler
        .deployer()
        .rollback(&id)
        .await
        .map_err(|e| match e {
            RollbackError::UnknownSlot(id) => ApiError::NotFound(format!("Slot {} not found", id)),
            err @ RollbackError::NoPrevious(_) => ApiError::Conflict(err.to_string()),
            err @ RollbackError::Failed(_) => ApiError::InternalError(err.to_string()),
        })?;

    Ok(Json(slot))
}
