//! Run domain types
//!
//! A run is one execution of a pipeline definition against one revision.
//! The run owns its stage results; only the scheduler executing the run
//! mutates them, through the transition methods below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::InvalidTransition;
use crate::domain::pipeline::PipelineDefinition;

/// Run identifier, unique and monotonic per orchestrator
pub type RunId = u64;

/// One execution of a pipeline against one revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub pipeline: String,
    pub revision_id: String,
    pub definition_version: u32,
    pub status: RunStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageResult>,
    /// Reason the run did not succeed
    pub error: Option<String>,
}

impl Run {
    /// Creates a queued run with one pending result per stage
    pub fn new(run_id: RunId, definition: &PipelineDefinition, revision_id: &str) -> Self {
        let stages = definition
            .stages
            .iter()
            .map(|spec| StageResult::pending(run_id, &spec.name))
            .collect();

        Self {
            run_id,
            pipeline: definition.name.clone(),
            revision_id: revision_id.to_string(),
            definition_version: definition.version,
            status: RunStatus::Queued,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stages,
            error: None,
        }
    }

    /// Moves the run to a new status, rejecting moves out of a terminal status
    pub fn transition(&mut self, to: RunStatus) -> Result<(), InvalidTransition> {
        let allowed = match (self.status, to) {
            (RunStatus::Queued, RunStatus::Running) => true,
            (RunStatus::Queued | RunStatus::Running, s) if s.is_terminal() => true,
            _ => false,
        };

        if !allowed {
            return Err(InvalidTransition::new(self.status, to));
        }

        let now = Utc::now();
        if to == RunStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    /// Marks every stage that has not started as skipped
    pub fn skip_pending_stages(&mut self) {
        for stage in &mut self.stages {
            if stage.status == StageStatus::Pending {
                // Pending -> Skipped is always legal
                let _ = stage.transition(StageStatus::Skipped);
            }
        }
    }

    /// Whether the run is queued or running
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut StageResult> {
        self.stages.get_mut(index)
    }
}

/// Run execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "Queued",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(RunStatus::Queued),
            "Running" => Ok(RunStatus::Running),
            "Succeeded" => Ok(RunStatus::Succeeded),
            "Failed" => Ok(RunStatus::Failed),
            "Aborted" => Ok(RunStatus::Aborted),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Outcome of one stage within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub status: StageStatus,
    pub attempts: u32,
    /// Key under which this stage's log entries are stored
    pub log_ref: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StageResult {
    pub fn pending(run_id: RunId, stage_name: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            status: StageStatus::Pending,
            attempts: 0,
            log_ref: log_ref(run_id, stage_name),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Moves the stage to a new status
    ///
    /// Terminal statuses are final. Re-entering `Running` from `Running`
    /// is how a retry is recorded and bumps the attempt count.
    pub fn transition(&mut self, to: StageStatus) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition::new(self.status, to));
        }

        let now = Utc::now();
        match to {
            StageStatus::Pending => return Err(InvalidTransition::new(self.status, to)),
            StageStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.attempts += 1;
            }
            _ => self.finished_at = Some(now),
        }
        self.status = to;
        Ok(())
    }

    /// Wall-clock duration once the stage has finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Stage execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "Pending"),
            StageStatus::Running => write!(f, "Running"),
            StageStatus::Succeeded => write!(f, "Succeeded"),
            StageStatus::Failed => write!(f, "Failed"),
            StageStatus::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Log key for a stage of a run
pub fn log_ref(run_id: RunId, stage_name: &str) -> String {
    format!("run/{run_id}/stage/{stage_name}")
}
