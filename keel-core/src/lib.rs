//! Keel Core
//!
//! Core types and abstractions for the Keel pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: Core business entities (Revision, Pipeline, Run, Artifact, Slot)
//! - DTOs: Data transfer objects for communication between the API and its clients

pub mod domain;
pub mod dto;
