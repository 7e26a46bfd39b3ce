//! Source providers
//!
//! A source provider supplies content-addressed snapshots of a pipeline's
//! repository. The scheduler polls `latest_revision` and treats a revision
//! as new when its id differs from the last one observed for the pipeline.

mod git;
mod memory;

pub use git::GitSourceProvider;
pub use memory::MemorySourceProvider;

use async_trait::async_trait;
use keel_core::domain::error::StageError;
use keel_core::domain::pipeline::SourceSpec;
use keel_core::domain::revision::{Revision, Snapshot};
use thiserror::Error;

/// Errors reported by a source provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Transient network or auth failure
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// A previously observed revision no longer exists
    #[error("revision {0} not found")]
    RevisionNotFound(String),

    /// The revision id cannot name a commit of this provider
    #[error("invalid revision id '{0}'")]
    InvalidRevision(String),

    /// The provider has no source configured for the pipeline
    #[error("no source configured for pipeline {0}")]
    UnknownPipeline(String),
}

impl From<SourceError> for StageError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(msg) => StageError::SourceUnavailable(msg),
            SourceError::RevisionNotFound(id) => StageError::RevisionNotFound(id),
            SourceError::UnknownPipeline(name) => {
                StageError::Internal(format!("no source configured for pipeline {name}"))
            }
            SourceError::InvalidRevision(id) => {
                StageError::Internal(format!("invalid revision id '{id}'"))
            }
        }
    }
}

/// Supplier of revisions and snapshots
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Registers the source location of a pipeline
    async fn watch(&self, _pipeline: &str, _source: &SourceSpec) {}

    /// Returns the newest revision of the pipeline's source
    async fn latest_revision(&self, pipeline: &str) -> Result<Revision, SourceError>;

    /// Fetches the content of a revision
    async fn fetch_snapshot(
        &self,
        pipeline: &str,
        revision_id: &str,
    ) -> Result<Snapshot, SourceError>;

    /// Releases whatever the provider holds for a snapshot
    async fn release(&self, _snapshot: &Snapshot) -> Result<(), SourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_classification() {
        let err: StageError = SourceError::Unavailable("timeout".into()).into();
        assert!(err.is_transient());

        let err: StageError = SourceError::RevisionNotFound("abc".into()).into();
        assert_eq!(err, StageError::RevisionNotFound("abc".into()));
        assert!(!err.is_transient());

        let err: StageError = SourceError::UnknownPipeline("p".into()).into();
        assert!(!err.is_transient());

        let err: StageError = SourceError::InvalidRevision("../x".into()).into();
        assert!(!err.is_transient());
        assert!(!err.raises_alert());
    }
}
