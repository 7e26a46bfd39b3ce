//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::RunId;

/// Immutable build output
///
/// Identified by the pipeline and run that produced it, and addressed by
/// content digest. Mutable aliases (tags) point at the digest; the artifact
/// itself is never changed in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub pipeline: String,
    pub run_id: RunId,
    /// Content hash, hex encoded sha256
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl Artifact {
    /// Abbreviated digest for logs and display
    pub fn short_digest(&self) -> &str {
        short_digest(&self.digest)
    }
}

/// A mutable alias and the digest it currently points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    pub namespace: String,
    pub tag: String,
    pub digest: String,
}

/// First 12 characters of a digest
pub fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
