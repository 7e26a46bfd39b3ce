//! Keel Orchestrator
//!
//! Watches pipeline sources, builds content-addressed artifacts, publishes
//! them to the artifact registry and rolls them out to deployment slots.
//!
//! Architecture:
//! - Source: revision detection and snapshot checkout
//! - Builder: layer-cached image builds
//! - Registry: digests and mutable aliases
//! - Deploy: slot rollout with readiness checks and rollback
//! - Scheduler: coalescing triggers, run execution, retry and cleanup
//! - Store: definitions, run history and run logs
//! - API: HTTP surface for the CLI and webhooks

pub mod api;
pub mod builder;
pub mod config;
pub mod deploy;
pub mod digest;
pub mod pipelines;
pub mod podman;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod store;

#[cfg(test)]
mod testing;
