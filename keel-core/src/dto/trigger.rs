//! Trigger DTOs
//!
//! Webhook notification that a revision is available for a pipeline.

use serde::{Deserialize, Serialize};

use crate::domain::run::RunId;

/// "revision X is available for pipeline Y"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRevision {
    pub revision: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// What the scheduler did with a detected revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// No run was active; a run was created for the revision
    Started { run_id: RunId },
    /// A run is active; the revision replaced any pending one
    Queued,
    /// The revision is already running or pending
    Duplicate,
}
