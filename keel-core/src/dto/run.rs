//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::{Run, RunId, RunStatus};

/// Run summary for history listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pipeline: String,
    pub revision_id: String,
    pub status: RunStatus,
    pub requested_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Run> for RunSummary {
    fn from(run: Run) -> Self {
        Self {
            run_id: run.run_id,
            pipeline: run.pipeline,
            revision_id: run.revision_id,
            status: run.status,
            requested_at: run.requested_at,
            finished_at: run.finished_at,
        }
    }
}
