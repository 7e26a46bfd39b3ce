//! Artifact registry
//!
//! Keeps one record per artifact, keyed by the pipeline (namespace) and
//! run that produced it, and mutable aliases (tags) by `(namespace, tag)`.
//! Several records can share a digest when a rebuild produces identical
//! content; the content itself is stored once per namespace by the
//! [`RegistryBackend`].
//!
//! All alias changes happen under a single write lock, so a reader sees
//! either the old or the new artifact for a tag, never a missing one. Every
//! record carries a count of the aliases pointing at it; `prune` only
//! considers records whose count has reached zero.

mod credentials;
mod podman;

pub use credentials::{Credential, CredentialStore, EnvCredentialStore, StaticCredentials};
pub use podman::PodmanRegistryBackend;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::domain::artifact::{Artifact, TagRef, short_digest};
use keel_core::domain::error::StageError;
use keel_core::domain::run::RunId;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Push failures, classified for the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("registry unreachable: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("quota exceeded for namespace {namespace}: {limit} artifacts")]
    Quota { namespace: String, limit: usize },
}

impl PushError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, PushError::Network(_))
    }
}

impl From<PushError> for StageError {
    fn from(err: PushError) -> Self {
        StageError::Push {
            transient: err.is_transient(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tag {namespace}:{tag} not found")]
    TagNotFound { namespace: String, tag: String },

    #[error("artifact of run {run_id} not found in {namespace}")]
    ArtifactNotFound { namespace: String, run_id: RunId },
}

/// Where artifact content is stored
///
/// The registry owns the alias index; a backend only ever sees content,
/// addressed by namespace and digest.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Stores the content of `digest` under `namespace`
    async fn upload(
        &self,
        namespace: &str,
        digest: &str,
        credential: Option<&Credential>,
    ) -> Result<(), PushError>;

    /// Drops the content of `digest` from `namespace`
    async fn delete(&self, namespace: &str, digest: &str) -> anyhow::Result<()>;
}

/// Which unreferenced artifacts prune may remove
#[derive(Debug, Clone, Copy)]
pub struct PrunePolicy {
    /// Minimum age of an artifact before it can be removed
    pub retention: std::time::Duration,
}

/// What a prune removed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Artifact records dropped from the index
    pub removed: Vec<(String, RunId)>,
    /// Digests no namespace holds any more
    pub released: Vec<String>,
    /// Content deletions the backend could not complete
    pub failures: Vec<String>,
}

/// An alias moved by a push, with the run it pointed at before
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasChange {
    pub tag: String,
    pub previous: Option<RunId>,
}

type RecordKey = (String, RunId);

#[derive(Debug, Default)]
struct RegistryState {
    artifacts: HashMap<RecordKey, Artifact>,
    aliases: HashMap<(String, String), RunId>,
    refcounts: HashMap<RecordKey, usize>,
}

impl RegistryState {
    /// Points `(namespace, tag)` at the artifact of `run_id`
    ///
    /// Returns `None` when the alias already pointed there, otherwise the
    /// run it pointed at before (if any).
    fn point(&mut self, namespace: &str, tag: &str, run_id: RunId) -> Option<Option<RunId>> {
        let key = (namespace.to_string(), tag.to_string());
        let previous = match self.aliases.insert(key, run_id) {
            Some(old) if old == run_id => return None,
            Some(old) => {
                self.release(namespace, old);
                Some(old)
            }
            None => None,
        };
        *self
            .refcounts
            .entry((namespace.to_string(), run_id))
            .or_default() += 1;
        Some(previous)
    }

    fn release(&mut self, namespace: &str, run_id: RunId) {
        if let Some(count) = self.refcounts.get_mut(&(namespace.to_string(), run_id)) {
            *count = count.saturating_sub(1);
        }
    }

    /// Whether any record of `namespace` holds `digest`
    fn holds(&self, namespace: &str, digest: &str) -> bool {
        self.artifacts
            .values()
            .any(|a| a.pipeline == namespace && a.digest == digest)
    }

    /// Distinct digests held by a namespace
    fn namespace_size(&self, namespace: &str) -> usize {
        self.artifacts
            .values()
            .filter(|a| a.pipeline == namespace)
            .map(|a| a.digest.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    fn check_quota(&self, quota: Option<usize>, artifact: &Artifact) -> Result<(), PushError> {
        let namespace = artifact.pipeline.as_str();
        match quota {
            Some(limit)
                if !self.holds(namespace, &artifact.digest)
                    && self.namespace_size(namespace) >= limit =>
            {
                Err(PushError::Quota {
                    namespace: namespace.to_string(),
                    limit,
                })
            }
            _ => Ok(()),
        }
    }
}

pub struct ArtifactRegistry {
    state: RwLock<RegistryState>,
    backend: Arc<dyn RegistryBackend>,
    credentials: Arc<dyn CredentialStore>,
    /// Maximum distinct digests per namespace
    quota: Option<usize>,
}

impl ArtifactRegistry {
    pub fn new(backend: Arc<dyn RegistryBackend>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            backend,
            credentials,
            quota: None,
        }
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Stores `artifact` and points each tag in its namespace at it
    ///
    /// Content already held by the namespace is not uploaded again. Pushing
    /// an artifact under a tag that already points at it changes nothing.
    /// Returns the aliases that moved.
    pub async fn push(
        &self,
        artifact: &Artifact,
        tags: &[String],
        credential: Option<&str>,
    ) -> Result<Vec<AliasChange>, PushError> {
        let resolved = match credential {
            Some(id) => Some(self.credentials.resolve(id).ok_or_else(|| {
                PushError::Auth(format!("credential '{id}' could not be resolved"))
            })?),
            None => None,
        };

        let namespace = artifact.pipeline.as_str();
        let needs_upload = {
            let state = self.state.read().await;
            state.check_quota(self.quota, artifact)?;
            !state.holds(namespace, &artifact.digest)
        };

        if needs_upload {
            debug!(
                namespace,
                digest = artifact.short_digest(),
                credential = resolved.as_ref().map(|c| c.id.as_str()),
                "uploading artifact"
            );
            self.backend
                .upload(namespace, &artifact.digest, resolved.as_ref())
                .await?;
        }

        let mut state = self.state.write().await;
        let key = (namespace.to_string(), artifact.run_id);
        if !state.artifacts.contains_key(&key) {
            state.check_quota(self.quota, artifact)?;
            state.artifacts.insert(key.clone(), artifact.clone());
            state.refcounts.entry(key).or_default();
        }

        let mut changes = Vec::new();
        for tag in tags {
            if let Some(previous) = state.point(namespace, tag, artifact.run_id) {
                info!(
                    namespace,
                    tag = tag.as_str(),
                    run_id = artifact.run_id,
                    digest = artifact.short_digest(),
                    "tag updated"
                );
                changes.push(AliasChange {
                    tag: tag.clone(),
                    previous,
                });
            }
        }

        Ok(changes)
    }

    /// Resolves `(namespace, tag)` to the artifact it points at
    pub async fn pull(&self, namespace: &str, tag: &str) -> Result<Artifact, RegistryError> {
        let state = self.state.read().await;
        state
            .aliases
            .get(&(namespace.to_string(), tag.to_string()))
            .and_then(|run_id| state.artifacts.get(&(namespace.to_string(), *run_id)))
            .cloned()
            .ok_or_else(|| RegistryError::TagNotFound {
                namespace: namespace.to_string(),
                tag: tag.to_string(),
            })
    }

    /// Atomically repoints `(namespace, tag)` at the artifact of `run_id`
    pub async fn retag(&self, namespace: &str, tag: &str, run_id: RunId) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        if !state
            .artifacts
            .contains_key(&(namespace.to_string(), run_id))
        {
            return Err(RegistryError::ArtifactNotFound {
                namespace: namespace.to_string(),
                run_id,
            });
        }
        state.point(namespace, tag, run_id);
        info!(namespace, tag, run_id, "tag repointed");
        Ok(())
    }

    /// Removes `(namespace, tag)`, releasing its reference
    pub async fn untag(&self, namespace: &str, tag: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let run_id = state
            .aliases
            .remove(&(namespace.to_string(), tag.to_string()))
            .ok_or_else(|| RegistryError::TagNotFound {
                namespace: namespace.to_string(),
                tag: tag.to_string(),
            })?;
        state.release(namespace, run_id);
        info!(namespace, tag, run_id, "tag removed");
        Ok(())
    }

    /// Removes unreferenced artifacts older than the retention threshold
    ///
    /// Artifacts whose digest is in `live` (backing a deployment slot) are
    /// always kept. Content is deleted from the backend once the last record
    /// of a namespace holding it is gone.
    pub async fn prune(&self, policy: &PrunePolicy, live: &HashSet<String>) -> PruneReport {
        let retention = chrono::Duration::from_std(policy.retention)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(retention);

        let mut report = PruneReport::default();
        let mut orphaned: Vec<(String, String)> = Vec::new();
        {
            let mut state = self.state.write().await;
            let mut removable: Vec<RecordKey> = state
                .artifacts
                .iter()
                .filter(|(key, _)| state.refcounts.get(*key).copied().unwrap_or(0) == 0)
                .filter(|(_, a)| !live.contains(&a.digest))
                .filter(|(_, a)| cutoff.is_some_and(|cutoff| a.created_at <= cutoff))
                .map(|(key, _)| key.clone())
                .collect();
            removable.sort();

            for key in removable {
                let Some(artifact) = state.artifacts.remove(&key) else {
                    continue;
                };
                state.refcounts.remove(&key);
                debug!(namespace = %key.0, run_id = key.1, digest = artifact.short_digest(), "pruned artifact");

                if !state.holds(&key.0, &artifact.digest) {
                    orphaned.push((key.0.clone(), artifact.digest.clone()));
                }
                report.removed.push(key);
            }

            for (_, digest) in &orphaned {
                let still_held = state.artifacts.values().any(|a| &a.digest == digest);
                if !still_held && !report.released.contains(digest) {
                    report.released.push(digest.clone());
                }
            }
        }

        for (namespace, digest) in orphaned {
            if let Err(e) = self.backend.delete(&namespace, &digest).await {
                warn!(namespace = %namespace, digest = short_digest(&digest), "failed to delete content: {:#}", e);
                report
                    .failures
                    .push(format!("{namespace}@{}: {e:#}", short_digest(&digest)));
            }
        }

        if !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                released = report.released.len(),
                "registry prune complete"
            );
        }
        report
    }

    /// Aliases in a namespace, sorted by tag
    pub async fn list_tags(&self, namespace: &str) -> Vec<TagRef> {
        let state = self.state.read().await;
        let mut tags: Vec<TagRef> = state
            .aliases
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter_map(|((ns, tag), run_id)| {
                let artifact = state.artifacts.get(&(ns.clone(), *run_id))?;
                Some(TagRef {
                    namespace: ns.clone(),
                    tag: tag.clone(),
                    digest: artifact.digest.clone(),
                })
            })
            .collect();
        tags.sort_by(|a, b| a.tag.cmp(&b.tag));
        tags
    }

    /// The artifact produced by a run
    pub async fn artifact(&self, namespace: &str, run_id: RunId) -> Option<Artifact> {
        self.state
            .read()
            .await
            .artifacts
            .get(&(namespace.to_string(), run_id))
            .cloned()
    }

    /// Whether any record holds `digest`
    pub async fn contains_digest(&self, digest: &str) -> bool {
        self.state
            .read()
            .await
            .artifacts
            .values()
            .any(|a| a.digest == digest)
    }

    /// Every digest held by some record
    pub async fn digests(&self) -> HashSet<String> {
        self.state
            .read()
            .await
            .artifacts
            .values()
            .map(|a| a.digest.clone())
            .collect()
    }

    /// Number of aliases pointing at any record with `digest`
    pub async fn refcount(&self, digest: &str) -> usize {
        let state = self.state.read().await;
        state
            .artifacts
            .iter()
            .filter(|(_, a)| a.digest == digest)
            .map(|(key, _)| state.refcounts.get(key).copied().unwrap_or(0))
            .sum()
    }
}
