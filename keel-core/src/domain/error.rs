//! Error taxonomy shared by the orchestrator components
//!
//! Components report classified `StageError`s; the scheduler is the only
//! place that decides whether to retry them.

use thiserror::Error;

/// Failure of one stage attempt, classified at the stage boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Network or auth hiccup talking to the source provider
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A previously observed revision can no longer be fetched
    #[error("revision {0} not found")]
    RevisionNotFound(String),

    /// A build step exited non-zero
    #[error("build failed at step {step_index} with exit code {exit_code}")]
    Build {
        step_index: usize,
        exit_code: i32,
        log_tail: String,
    },

    /// Registry push failed; `transient` marks network-class failures
    #[error("push failed: {reason}")]
    Push { reason: String, transient: bool },

    /// The new instance failed its readiness check and was rolled back
    #[error("deploy failed: {reason}")]
    Deploy { reason: String },

    /// The stage did not finish within its timeout
    #[error("stage timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Stage parameters could not be decoded for its action
    #[error("invalid stage parameters: {0}")]
    InvalidParameters(String),

    /// A stage needs output of an earlier stage that did not produce it
    #[error("missing input: {0}")]
    MissingInput(String),

    /// The run was aborted while the stage was in flight
    #[error("aborted")]
    Aborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Whether the failure kind is transient and worth retrying
    ///
    /// Only honoured for stages that declare themselves retryable.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            StageError::SourceUnavailable(_)
                | StageError::Push {
                    transient: true,
                    ..
                }
                | StageError::Timeout { .. }
        )
    }

    /// Whether the failure should raise a pipeline-level alert
    pub const fn raises_alert(&self) -> bool {
        matches!(self, StageError::RevisionNotFound(_))
    }
}

/// Rejected status change on a run or stage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub fn new(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
