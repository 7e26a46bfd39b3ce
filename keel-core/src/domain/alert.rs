//! Alert domain types
//!
//! Alerts surface conditions that need an operator but do not change the
//! outcome of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::RunId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub raised_at: DateTime<Utc>,
    pub pipeline: String,
    pub run_id: Option<RunId>,
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn new(
        pipeline: impl Into<String>,
        run_id: Option<RunId>,
        kind: AlertKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            raised_at: Utc::now(),
            pipeline: pipeline.into(),
            run_id,
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    /// A previously observed revision disappeared from the source
    RevisionNotFound,
    /// Post-run cleanup failed
    CleanupFailed,
}
