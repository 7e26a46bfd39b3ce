//! Data Transfer Objects
//!
//! DTOs used between the orchestrator API and its clients (CLI, webhooks).
//! They are lightweight representations of domain entities optimized for
//! network transfer.

pub mod pipeline;
pub mod run;
pub mod trigger;
