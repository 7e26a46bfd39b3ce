//! Git source provider
//!
//! Shells out to the `git` binary:
//! - `git ls-remote` to discover the head of the watched branch
//! - a shallow fetch of exactly one commit into a per-revision checkout
//!
//! The snapshot digest is derived from the commit's tree id, so two
//! revisions with identical content share a digest.
//!
//! Revision ids must be full or abbreviated commit hashes. They are used
//! as checkout directory names and passed to `git fetch` after
//! `--end-of-options`, and checkouts never leave the workspace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use keel_core::domain::pipeline::SourceSpec;
use keel_core::domain::revision::{Revision, Snapshot};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{SourceError, SourceProvider};
use crate::digest::digest_str;

pub struct GitSourceProvider {
    workspace: PathBuf,
    sources: RwLock<HashMap<String, SourceSpec>>,
    last_seen: RwLock<HashMap<String, String>>,
}

impl GitSourceProvider {
    /// Creates a provider that checks revisions out under `workspace`
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            sources: RwLock::new(HashMap::new()),
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    async fn source_for(&self, pipeline: &str) -> Result<SourceSpec, SourceError> {
        self.sources
            .read()
            .await
            .get(pipeline)
            .cloned()
            .ok_or_else(|| SourceError::UnknownPipeline(pipeline.to_string()))
    }

    fn checkout_dir(&self, pipeline: &str, revision_id: &str) -> Result<PathBuf, SourceError> {
        if !is_commit_id(revision_id) {
            return Err(SourceError::InvalidRevision(revision_id.to_string()));
        }
        if !is_path_segment(pipeline) {
            return Err(SourceError::Unavailable(format!(
                "pipeline name '{pipeline}' cannot be used as a checkout directory"
            )));
        }
        Ok(self.workspace.join(pipeline).join(revision_id))
    }

    /// Whether `dir` is a checkout directory inside the workspace
    fn owns(&self, dir: &Path) -> bool {
        dir.strip_prefix(&self.workspace).is_ok_and(|rest| {
            let parts: Vec<_> = rest.components().collect();
            parts.len() == 2
                && parts
                    .iter()
                    .all(|c| matches!(c, std::path::Component::Normal(_)))
        })
    }

    async fn checkout(
        &self,
        source: &SourceSpec,
        dir: &Path,
        revision_id: &str,
    ) -> Result<(), SourceError> {
        if dir.join(".git").exists() {
            let head = run_git(&["rev-parse", "HEAD"], Some(dir)).await;
            if matches!(&head, Ok(out) if out.success && out.stdout.trim() == revision_id) {
                debug!(path = %dir.display(), "reusing existing checkout");
                return Ok(());
            }
            tokio::fs::remove_dir_all(dir)
                .await
                .map_err(|e| SourceError::Unavailable(format!("failed to reset checkout: {e}")))?;
        }

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SourceError::Unavailable(format!("failed to create checkout: {e}")))?;

        git_checked(&["init", "--quiet"], dir).await?;

        let fetch = run_git(
            &[
                "fetch",
                "--quiet",
                "--depth",
                "1",
                "--end-of-options",
                &source.repository,
                revision_id,
            ],
            Some(dir),
        )
        .await
        .map_err(|e| SourceError::Unavailable(format!("{e:#}")))?;

        if !fetch.success {
            return Err(classify_fetch_failure(revision_id, &fetch.stderr));
        }

        git_checked(&["checkout", "--quiet", "--detach", "FETCH_HEAD"], dir).await?;
        Ok(())
    }
}

#[async_trait]
impl SourceProvider for GitSourceProvider {
    async fn watch(&self, pipeline: &str, source: &SourceSpec) {
        info!(
            pipeline,
            repository = %source.repository,
            branch = %source.branch,
            "watching source"
        );
        self.sources
            .write()
            .await
            .insert(pipeline.to_string(), source.clone());
    }

    async fn latest_revision(&self, pipeline: &str) -> Result<Revision, SourceError> {
        let source = self.source_for(pipeline).await?;
        let reference = format!("refs/heads/{}", source.branch);

        let output = run_git(&["ls-remote", &source.repository, &reference], None)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{e:#}")))?;

        if !output.success {
            return Err(SourceError::Unavailable(output.stderr.trim().to_string()));
        }

        let head = parse_ls_remote(&output.stdout, &reference).ok_or_else(|| {
            SourceError::Unavailable(format!(
                "branch {} not found in {}",
                source.branch, source.repository
            ))
        })?;

        let mut last_seen = self.last_seen.write().await;
        let parent_id = last_seen
            .get(pipeline)
            .filter(|id| **id != head)
            .cloned();
        last_seen.insert(pipeline.to_string(), head.clone());

        Ok(Revision::new(head, parent_id))
    }

    async fn fetch_snapshot(
        &self,
        pipeline: &str,
        revision_id: &str,
    ) -> Result<Snapshot, SourceError> {
        let dir = self.checkout_dir(pipeline, revision_id)?;
        let source = self.source_for(pipeline).await?;

        self.checkout(&source, &dir, revision_id).await?;

        let tree = git_checked(&["rev-parse", "HEAD^{tree}"], &dir).await?;
        let digest = digest_str(&format!("tree:{}", tree.trim()));

        info!(pipeline, revision = revision_id, path = %dir.display(), "snapshot ready");

        Ok(Snapshot {
            revision_id: revision_id.to_string(),
            digest,
            path: Some(dir),
        })
    }

    async fn release(&self, snapshot: &Snapshot) -> Result<(), SourceError> {
        let Some(dir) = &snapshot.path else {
            return Ok(());
        };
        if !self.owns(dir) {
            return Err(SourceError::Unavailable(format!(
                "refusing to remove {}: not a checkout of this workspace",
                dir.display()
            )));
        }
        if !dir.exists() {
            return Ok(());
        }

        tokio::fs::remove_dir_all(dir).await.map_err(|e| {
            SourceError::Unavailable(format!("failed to remove {}: {e}", dir.display()))
        })?;
        debug!(path = %dir.display(), "checkout removed");
        Ok(())
    }
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> anyhow::Result<GitOutput> {
    let mut command = Command::new("git");
    command.args(args).env("GIT_TERMINAL_PROMPT", "0");
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args[0]))?;

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        debug!("git {} failed: {}", args[0], stderr.trim());
    }

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr,
    })
}

async fn git_checked(args: &[&str], cwd: &Path) -> Result<String, SourceError> {
    let output = run_git(args, Some(cwd))
        .await
        .map_err(|e| SourceError::Unavailable(format!("{e:#}")))?;

    if !output.success {
        warn!("git {} failed in {}", args[0], cwd.display());
        return Err(SourceError::Unavailable(output.stderr.trim().to_string()));
    }

    Ok(output.stdout)
}

/// Abbreviated (at least 7) or full (40 or 64) hex commit hash
fn is_commit_id(id: &str) -> bool {
    (7..=64).contains(&id.len()) && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_path_segment(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Extracts the commit id for `reference` from `git ls-remote` output
fn parse_ls_remote(stdout: &str, reference: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (sha, name) = line.split_once('\t')?;
        (name.trim() == reference && !sha.is_empty()).then(|| sha.trim().to_string())
    })
}

/// A fetch that fails because the commit is gone is not worth retrying
fn classify_fetch_failure(revision_id: &str, stderr: &str) -> SourceError {
    const GONE: [&str; 3] = ["not our ref", "couldn't find remote ref", "no such remote ref"];

    let lower = stderr.to_lowercase();
    if GONE.iter().any(|marker| lower.contains(marker)) {
        SourceError::RevisionNotFound(revision_id.to_string())
    } else {
        SourceError::Unavailable(stderr.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_remote() {
        let out = "3f2a9c1e\trefs/heads/main\n9b8c7d6e\trefs/heads/main-old\n";
        assert_eq!(
            parse_ls_remote(out, "refs/heads/main"),
            Some("3f2a9c1e".to_string())
        );
        assert_eq!(parse_ls_remote(out, "refs/heads/dev"), None);
        assert_eq!(parse_ls_remote("", "refs/heads/main"), None);
    }

    #[test]
    fn test_classify_fetch_failure() {
        let gone = classify_fetch_failure(
            "abc123",
            "fatal: remote error: upload-pack: not our ref abc123",
        );
        assert_eq!(gone, SourceError::RevisionNotFound("abc123".into()));

        let flaky = classify_fetch_failure("abc123", "fatal: unable to access: Could not resolve host");
        assert!(matches!(flaky, SourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unwatched_pipeline_is_unknown() {
        let provider = GitSourceProvider::new(std::env::temp_dir());
        let err = provider.latest_revision("ghost").await.unwrap_err();
        assert_eq!(err, SourceError::UnknownPipeline("ghost".into()));
    }

    #[test]
    fn test_commit_ids() {
        assert!(is_commit_id("3f2a9c1"));
        assert!(is_commit_id(&"a".repeat(40)));
        assert!(!is_commit_id("3f2a9c"));
        assert!(!is_commit_id("r7"));
        assert!(!is_commit_id("--upload-pack=touch"));
        assert!(!is_commit_id(&"a".repeat(65)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_ids_outside_workspace() {
        let workspace = tempfile::tempdir().unwrap();
        let victim = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(victim.path().join(".git")).unwrap();
        std::fs::write(victim.path().join("precious.txt"), "keep").unwrap();
        let marker = workspace.path().join("marker");

        let provider = GitSourceProvider::new(workspace.path().to_path_buf());
        provider
            .watch(
                "app",
                &SourceSpec {
                    repository: "https://example.invalid/app.git".into(),
                    branch: "main".into(),
                },
            )
            .await;

        let escape = victim.path().display().to_string();
        let option = format!("--upload-pack=touch {}", marker.display());
        for id in [escape.as_str(), "../../etc", option.as_str()] {
            let err = provider.fetch_snapshot("app", id).await.unwrap_err();
            assert_eq!(err, SourceError::InvalidRevision(id.to_string()));
        }

        assert!(victim.path().join("precious.txt").exists());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_release_refuses_foreign_paths() {
        let workspace = tempfile::tempdir().unwrap();
        let victim = tempfile::tempdir().unwrap();
        let provider = GitSourceProvider::new(workspace.path().to_path_buf());

        let snapshot = Snapshot {
            revision_id: "abc1234".into(),
            digest: "d".into(),
            path: Some(victim.path().to_path_buf()),
        };
        assert!(provider.release(&snapshot).await.is_err());
        assert!(victim.path().exists());
    }

    #[tokio::test]
    async fn test_release_removes_checkout() {
        let workspace = tempfile::tempdir().unwrap();
        let provider = GitSourceProvider::new(workspace.path().to_path_buf());
        let dir = provider.checkout_dir("app", "abc1234").unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();

        let snapshot = Snapshot {
            revision_id: "abc1234".into(),
            digest: "d".into(),
            path: Some(dir.clone()),
        };
        provider.release(&snapshot).await.unwrap();
        assert!(!dir.exists());

        // Releasing twice is fine
        provider.release(&snapshot).await.unwrap();
    }
}
