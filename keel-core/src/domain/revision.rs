//! Revision domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest revision id accepted from outside
pub const MAX_REVISION_ID_LEN: usize = 128;

/// Immutable identifier of a source snapshot
///
/// Created by a source provider when it observes a change. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Content hash or sequence number identifying the snapshot
    pub id: String,

    /// When the revision was observed
    pub timestamp: DateTime<Utc>,

    /// Revision observed before this one for the same pipeline
    pub parent_id: Option<String>,
}

impl Revision {
    /// Creates a revision observed now
    pub fn new(id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            parent_id,
        }
    }

    /// Whether `id` is usable as a revision id
    ///
    /// Ids end up in file paths and command lines, so they are limited to
    /// ASCII alphanumerics, `.`, `_` and `-`, and must start with an
    /// alphanumeric.
    pub fn is_valid_id(id: &str) -> bool {
        let mut chars = id.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        id.len() <= MAX_REVISION_ID_LEN
            && first.is_ascii_alphanumeric()
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    /// Short form of the id for display and container names
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

/// Handle to fetched source content for one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Revision this snapshot was taken at
    pub revision_id: String,

    /// Content digest of the snapshot (hex sha256)
    pub digest: String,

    /// Local path of the checked-out content, if materialized on disk
    pub path: Option<std::path::PathBuf>,
}
