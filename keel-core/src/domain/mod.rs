//! Core domain types
//!
//! This module contains the core domain structures used across Keel crates.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (which owns and mutates them) and clients (which read them).

pub mod alert;
pub mod artifact;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod revision;
pub mod run;
pub mod slot;
