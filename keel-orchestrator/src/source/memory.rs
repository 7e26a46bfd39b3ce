//! In-memory source provider
//!
//! Revisions are published programmatically. Used by tests and by
//! deployments where revisions only arrive through the webhook.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use keel_core::domain::revision::{Revision, Snapshot};
use tokio::sync::RwLock;

use super::{SourceError, SourceProvider};
use crate::digest::digest_parts;

#[derive(Default)]
pub struct MemorySourceProvider {
    heads: RwLock<HashMap<String, Revision>>,
    removed: RwLock<HashSet<String>>,
    failures_left: AtomicU32,
    release_fails: AtomicBool,
}

impl MemorySourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a new head revision for a pipeline
    pub async fn publish(&self, pipeline: &str, revision_id: &str) -> Revision {
        let mut heads = self.heads.write().await;
        let parent_id = heads.get(pipeline).map(|r| r.id.clone());
        let revision = Revision::new(revision_id, parent_id);
        heads.insert(pipeline.to_string(), revision.clone());
        revision
    }

    /// Makes a revision unfetchable, as if it had been force-pushed away
    pub async fn remove(&self, revision_id: &str) {
        self.removed.write().await.insert(revision_id.to_string());
    }

    /// Makes the next `count` calls fail with `Unavailable`
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Makes every `release` fail
    pub fn fail_release(&self, fail: bool) {
        self.release_fails.store(fail, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), SourceError> {
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(SourceError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SourceProvider for MemorySourceProvider {
    async fn latest_revision(&self, pipeline: &str) -> Result<Revision, SourceError> {
        self.take_failure()?;

        self.heads
            .read()
            .await
            .get(pipeline)
            .cloned()
            .ok_or_else(|| SourceError::UnknownPipeline(pipeline.to_string()))
    }

    async fn fetch_snapshot(
        &self,
        pipeline: &str,
        revision_id: &str,
    ) -> Result<Snapshot, SourceError> {
        self.take_failure()?;

        if self.removed.read().await.contains(revision_id) {
            return Err(SourceError::RevisionNotFound(revision_id.to_string()));
        }

        Ok(Snapshot {
            revision_id: revision_id.to_string(),
            digest: digest_parts(&[pipeline.as_bytes(), revision_id.as_bytes()]),
            path: None,
        })
    }

    async fn release(&self, snapshot: &Snapshot) -> Result<(), SourceError> {
        if self.release_fails.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable(format!(
                "failed to release snapshot of {}",
                snapshot.revision_id
            )));
        }
        Ok(())
    }
}
