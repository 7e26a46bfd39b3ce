//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod pipeline;
pub mod registry;
pub mod run;
pub mod slot;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;

/// Create the main API router with all endpoints
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pipeline endpoints
        .route("/pipeline/create", post(pipeline::create_pipeline))
        .route("/pipeline/list", get(pipeline::list_pipelines))
        .route("/pipeline/{name}", get(pipeline::get_pipeline))
        .route("/pipeline/{name}/trigger", post(pipeline::trigger_pipeline))
        // Run endpoints
        .route("/run/pipeline/{name}", get(run::list_runs_by_pipeline))
        .route("/run/{id}", get(run::get_run))
        .route("/run/{id}/abort", post(run::abort_run))
        .route("/run/{id}/logs", get(run::get_run_logs))
        // Slot endpoints
        .route("/slot/list", get(slot::list_slots))
        .route("/slot/{id}", get(slot::get_slot))
        .route("/slot/{id}/rollback", post(slot::rollback_slot))
        // Registry endpoints
        .route("/registry/{namespace}/tags", get(registry::list_tags))
        .route("/registry/{namespace}/tags/{tag}", get(registry::pull_tag))
        .route("/alerts", get(registry::list_alerts))
        // Add state and middleware
        .with_state(scheduler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
