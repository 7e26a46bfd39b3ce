//! Image builder
//!
//! Turns a snapshot and a recipe into an immutable, content-addressed
//! artifact. Each recipe step produces a layer whose digest is a pure
//! function of its parent layer digest and the step definition:
//!
//! ```text
//! L0 = H("base", base_image, snapshot.digest, workdir)
//! Li = H("step", L(i-1), canonical_json(step_i))
//! Lc = H("config", Ln, canonical_json({cmd, workdir}))
//! ```
//!
//! L0 holds the snapshot copied into the working directory; Lc only sets
//! the image's start command. A layer already in the cache is reused
//! instead of re-executed. Lc is the artifact digest. A failing step
//! aborts the build and no artifact is returned; the builder never
//! registers anything itself.

mod cache;
mod podman;

pub use cache::{LayerCache, LayerRecord};
pub use podman::PodmanStepExecutor;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use keel_core::domain::artifact::{Artifact, short_digest};
use keel_core::domain::error::StageError;
use keel_core::domain::pipeline::{BuildStep, Recipe};
use keel_core::domain::revision::Snapshot;
use keel_core::domain::run::RunId;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::digest::digest_parts;

/// Number of log lines kept in a build failure
const LOG_TAIL_LINES: usize = 20;

/// Errors reported by the image builder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A recipe step exited non-zero
    #[error("step {step_index} exited with code {exit_code}")]
    StepFailed {
        step_index: usize,
        exit_code: i32,
        log_tail: String,
    },

    /// The execution context could not be set up or torn down
    #[error("build context error: {0}")]
    Context(String),
}

impl From<BuildError> for StageError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::StepFailed {
                step_index,
                exit_code,
                log_tail,
            } => StageError::Build {
                step_index,
                exit_code,
                log_tail,
            },
            BuildError::Context(msg) => StageError::Internal(msg),
        }
    }
}

/// What a step executor needs to produce the base layer
#[derive(Debug)]
pub struct BaseContext<'a> {
    pub base_image: &'a str,
    pub snapshot: &'a Snapshot,
    /// Directory the snapshot is copied into
    pub workdir: &'a str,
    /// Digest the produced layer must be stored under
    pub layer: &'a str,
}

/// What a step executor needs to produce one layer
#[derive(Debug)]
pub struct StepContext<'a> {
    pub step_index: usize,
    pub step: &'a BuildStep,
    /// Digest of the layer the step runs on top of
    pub parent_layer: &'a str,
    /// Digest the produced layer must be stored under
    pub layer: &'a str,
    pub workdir: &'a str,
}

/// Result of executing one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub log: String,
    pub size_bytes: u64,
}

/// Executes recipe steps in disposable, isolated contexts
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Materializes the base layer: the base image plus the snapshot
    ///
    /// Returns the size of the base layer.
    async fn prepare_base(&self, ctx: BaseContext<'_>) -> anyhow::Result<u64>;

    /// Runs one step on top of its parent layer and stores the result as `layer`
    async fn run_step(&self, ctx: StepContext<'_>) -> anyhow::Result<StepOutcome>;

    /// Stores `parent_layer` as `layer` with the recipe's command and workdir
    async fn finalize(&self, parent_layer: &str, layer: &str, recipe: &Recipe)
    -> anyhow::Result<u64>;

    /// Deletes the stored image of a layer
    async fn remove_layer(&self, layer: &str) -> anyhow::Result<()>;
}

/// A successfully built artifact and how it was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub artifact: Artifact,
    pub layers: Vec<String>,
    pub cached_layers: usize,
    pub executed_layers: usize,
}

/// Builds artifacts from recipes, reusing cached layers
pub struct ImageBuilder {
    executor: Arc<dyn StepExecutor>,
    cache: LayerCache,
}

impl ImageBuilder {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            executor,
            cache: LayerCache::new(),
        }
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    /// Builds the artifact for `snapshot` following `recipe`
    pub async fn build(
        &self,
        pipeline: &str,
        run_id: RunId,
        snapshot: &Snapshot,
        recipe: &Recipe,
    ) -> Result<BuildOutput, BuildError> {
        info!(
            pipeline,
            run_id,
            revision = %snapshot.revision_id,
            steps = recipe.steps.len(),
            "starting build"
        );

        let mut layers = Vec::with_capacity(recipe.steps.len() + 1);
        let mut cached_layers = 0;
        let mut executed_layers = 0;
        let mut size_bytes = 0u64;

        let base = base_layer_digest(&recipe.base_image, &snapshot.digest, &recipe.workdir);
        match self.cache.get(&base).await {
            Some(record) => {
                cached_layers += 1;
                size_bytes += record.size_bytes;
            }
            None => {
                let size = self
                    .executor
                    .prepare_base(BaseContext {
                        base_image: &recipe.base_image,
                        snapshot,
                        workdir: &recipe.workdir,
                        layer: &base,
                    })
                    .await
                    .map_err(|e| BuildError::Context(format!("{e:#}")))?;
                self.cache.insert(LayerRecord::new(&base, None, size)).await;
                executed_layers += 1;
                size_bytes += size;
            }
        }
        layers.push(base);

        for (step_index, step) in recipe.steps.iter().enumerate() {
            let parent = layers.last().cloned().unwrap_or_default();
            let layer = step_layer_digest(&parent, step)?;

            if let Some(record) = self.cache.get(&layer).await {
                debug!(step_index, layer = short_digest(&layer), "layer cache hit");
                cached_layers += 1;
                size_bytes += record.size_bytes;
                layers.push(layer);
                continue;
            }

            debug!(step_index, layer = short_digest(&layer), "executing step");
            let outcome = self
                .executor
                .run_step(StepContext {
                    step_index,
                    step,
                    parent_layer: &parent,
                    layer: &layer,
                    workdir: &recipe.workdir,
                })
                .await
                .map_err(|e| BuildError::Context(format!("{e:#}")))?;

            if outcome.exit_code != 0 {
                warn!(
                    pipeline,
                    run_id,
                    step_index,
                    exit_code = outcome.exit_code,
                    "build step failed, discarding build context"
                );
                return Err(BuildError::StepFailed {
                    step_index,
                    exit_code: outcome.exit_code,
                    log_tail: log_tail(&outcome.log, LOG_TAIL_LINES),
                });
            }

            self.cache
                .insert(LayerRecord::new(&layer, Some(&parent), outcome.size_bytes))
                .await;
            executed_layers += 1;
            size_bytes += outcome.size_bytes;
            layers.push(layer);
        }

        let parent = layers.last().cloned().unwrap_or_default();
        let digest = config_layer_digest(&parent, recipe)?;
        if self.cache.get(&digest).await.is_some() {
            cached_layers += 1;
        } else {
            let size = self
                .executor
                .finalize(&parent, &digest, recipe)
                .await
                .map_err(|e| BuildError::Context(format!("{e:#}")))?;
            self.cache
                .insert(LayerRecord::new(&digest, Some(&parent), size))
                .await;
            executed_layers += 1;
        }
        layers.push(digest.clone());

        let artifact = Artifact {
            pipeline: pipeline.to_string(),
            run_id,
            digest,
            created_at: Utc::now(),
            size_bytes,
        };

        info!(
            pipeline,
            run_id,
            digest = artifact.short_digest(),
            cached_layers,
            executed_layers,
            "build complete"
        );

        Ok(BuildOutput {
            artifact,
            layers,
            cached_layers,
            executed_layers,
        })
    }
}

impl ImageBuilder {
    /// Deletes the layer chain ending at `digest`
    ///
    /// Walks from `digest` towards the base and stops at the first layer
    /// that is in `keep` or still has other cached children. Returns the
    /// layers removed.
    pub async fn evict(&self, digest: &str, keep: &HashSet<String>) -> anyhow::Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut next = Some(digest.to_string());

        while let Some(layer) = next.take() {
            if keep.contains(&layer) || self.cache.has_children(&layer).await {
                break;
            }
            let Some(record) = self.cache.get(&layer).await else {
                break;
            };

            self.executor
                .remove_layer(&layer)
                .await
                .with_context(|| format!("failed to remove layer {}", short_digest(&layer)))?;
            self.cache.remove(&layer).await;
            debug!(layer = short_digest(&layer), "layer evicted");

            removed.push(layer);
            next = record.parent;
        }

        Ok(removed)
    }
}

/// Digest of the base layer for a recipe and snapshot
pub fn base_layer_digest(base_image: &str, snapshot_digest: &str, workdir: &str) -> String {
    digest_parts(&[
        b"base",
        base_image.as_bytes(),
        snapshot_digest.as_bytes(),
        workdir.as_bytes(),
    ])
}

/// Digest of the layer produced by `step` on top of `parent`
pub fn step_layer_digest(parent: &str, step: &BuildStep) -> Result<String, BuildError> {
    let definition = serde_json::to_vec(step)
        .map_err(|e| BuildError::Context(format!("failed to encode step: {e}")))?;
    Ok(digest_parts(&[b"step", parent.as_bytes(), &definition]))
}

/// Digest of the layer that sets the recipe's command and workdir on `parent`
pub fn config_layer_digest(parent: &str, recipe: &Recipe) -> Result<String, BuildError> {
    let config = serde_json::to_vec(&serde_json::json!({
        "cmd": recipe.cmd,
        "workdir": recipe.workdir,
    }))
    .map_err(|e| BuildError::Context(format!("failed to encode image config: {e}")))?;
    Ok(digest_parts(&[b"config", parent.as_bytes(), &config]))
}

/// Last `lines` lines of a log
fn log_tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
