//! Podman step executor
//!
//! Every layer is a podman image tagged `localhost/keel-layer:<digest>`.
//! The base layer is the base image with the snapshot copied into the
//! recipe's working directory. A step runs in a throwaway container
//! created from its parent layer image; on success the container is
//! committed as the new layer image. The final layer is a commit that only
//! sets the start command and working directory. Containers are always
//! removed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::domain::pipeline::Recipe;
use tracing::debug;
use uuid::Uuid;

use super::{BaseContext, StepContext, StepExecutor, StepOutcome};
use crate::podman::{ContainerGuard, args, layer_image, podman, podman_checked};

/// Runs recipe steps in podman containers
#[derive(Debug, Default, Clone)]
pub struct PodmanStepExecutor;

impl PodmanStepExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn image_size(image: &str) -> Result<u64> {
        let out = podman_checked(&args(["image", "inspect", "--format", "{{.Size}}", image])).await?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    /// Start command of an image as a JSON array
    async fn image_cmd(image: &str) -> Result<String> {
        let out =
            podman_checked(&args(["image", "inspect", "--format", "{{json .Config.Cmd}}", image]))
                .await?;
        let cmd = out.trim();
        Ok(if cmd.is_empty() || cmd == "null" {
            "[]".to_string()
        } else {
            cmd.to_string()
        })
    }

    fn container() -> ContainerGuard {
        ContainerGuard::new(format!("keel-build-{}", Uuid::new_v4()))
    }
}

#[async_trait]
impl StepExecutor for PodmanStepExecutor {
    async fn prepare_base(&self, ctx: BaseContext<'_>) -> Result<u64> {
        let exists = podman(&args(["image", "exists", ctx.base_image])).await?;
        if !exists.success() {
            debug!("Pulling base image {}", ctx.base_image);
            podman_checked(&args(["pull", ctx.base_image])).await?;
        }

        let guard = Self::container();
        podman_checked(&args(["create", "--name", guard.name(), ctx.base_image])).await?;

        if let Some(path) = &ctx.snapshot.path {
            debug!("Copying {} into {}:{}", path.display(), guard.name(), ctx.workdir);
            podman_checked(&args([
                "cp",
                &format!("{}/.", path.display()),
                &format!("{}:{}", guard.name(), ctx.workdir),
            ]))
            .await
            .context("Failed to copy snapshot into base layer")?;
        }

        let target = layer_image(ctx.layer);
        podman_checked(&args(["commit", "--quiet", guard.name(), &target])).await?;
        Self::image_size(&target).await
    }

    async fn run_step(&self, ctx: StepContext<'_>) -> Result<StepOutcome> {
        let guard = Self::container();

        let mut run = args(["run", "--name", guard.name(), "--workdir", ctx.workdir]);
        for (key, value) in &ctx.step.env {
            run.push("-e".to_string());
            run.push(format!("{key}={value}"));
        }
        run.push(layer_image(ctx.parent_layer));
        run.extend(ctx.step.run.iter().cloned());

        debug!(
            "Running build step {} in {}: {:?}",
            ctx.step_index,
            guard.name(),
            ctx.step.run
        );
        let output = podman(&run).await?;
        let log = format!("{}{}", output.stdout, output.stderr);

        if !output.success() {
            return Ok(StepOutcome {
                exit_code: output.exit_code,
                log,
                size_bytes: 0,
            });
        }

        let target = layer_image(ctx.layer);
        podman_checked(&args(["commit", "--quiet", guard.name(), &target])).await?;
        let size_bytes = Self::image_size(&target).await?;

        Ok(StepOutcome {
            exit_code: 0,
            log,
            size_bytes,
        })
    }

    async fn finalize(&self, parent_layer: &str, layer: &str, recipe: &Recipe) -> Result<u64> {
        // Step commits inherit the step's argv as their command
        let cmd = if recipe.cmd.is_empty() {
            Self::image_cmd(&recipe.base_image).await?
        } else {
            serde_json::to_string(&recipe.cmd).context("Failed to encode start command")?
        };

        let guard = Self::container();
        podman_checked(&args(["create", "--name", guard.name(), &layer_image(parent_layer)])).await?;

        let target = layer_image(layer);
        podman_checked(&args([
            "commit",
            "--quiet",
            "--change",
            &format!("CMD {cmd}"),
            "--change",
            &format!("WORKDIR {}", recipe.workdir),
            guard.name(),
            &target,
        ]))
        .await?;
        Self::image_size(&target).await
    }

    async fn remove_layer(&self, layer: &str) -> Result<()> {
        podman_checked(&args(["rmi", "--ignore", &layer_image(layer)])).await?;
        Ok(())
    }
}
