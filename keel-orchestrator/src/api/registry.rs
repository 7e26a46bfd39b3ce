//! Registry and alert API Handlers

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use keel_core::domain::alert::Alert;
use keel_core::domain::artifact::{Artifact, TagRef};

use crate::api::error::{ApiError, ApiResult};
use crate::scheduler::Scheduler;

/// GET /registry/{namespace}/tags
pub async fn list_tags(
    State(scheduler): State<Arc<Scheduler>>,
    Path(namespace): Path<String>,
) -> Json<Vec<TagRef>> {
    Json(scheduler.registry().list_tags(&namespace).await)
}

/// GET /registry/{namespace}/tags/{tag}
/// Resolve an alias to its artifact
pub async fn pull_tag(
    State(scheduler): State<Arc<Scheduler>>,
    Path((namespace, tag)): Path<(String, String)>,
) -> ApiResult<Json<Artifact>> {
    scheduler
        .registry()
        .pull(&namespace, &tag)
        .await
        .map(Json)
        .map_err(|e| ApiError::NotFound(e.to_string()))
}

/// GET /alerts
pub async fn list_alerts(State(scheduler): State<Arc<Scheduler>>) -> Json<Vec<Alert>> {
    Json(scheduler.alerts().await)
}
