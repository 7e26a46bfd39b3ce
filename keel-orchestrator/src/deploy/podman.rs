//! Podman deploy target
//!
//! Instances are detached containers labelled with their slot id and
//! started from the artifact's layer image.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::DeployTarget;
use crate::podman::{SLOT_LABEL, args, layer_image, podman, podman_checked};

/// Runs slot instances as podman containers
#[derive(Debug, Default, Clone)]
pub struct PodmanDeployTarget {
    /// Extra `podman run` arguments, e.g. `--network` or `--env-file`
    run_args: Vec<String>,
    stop_timeout_secs: u32,
}

impl PodmanDeployTarget {
    pub fn new() -> Self {
        Self {
            run_args: Vec::new(),
            stop_timeout_secs: 10,
        }
    }

    pub fn with_run_args(mut self, run_args: Vec<String>) -> Self {
        self.run_args = run_args;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    health: Option<InspectHealth>,
    /// Older podman releases report health under this name
    #[serde(default)]
    healthcheck: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    state: InspectState,
}

/// Decides readiness from `podman inspect` output
///
/// A container with a healthcheck is ready once it reports `healthy`;
/// without one it is ready as soon as it is running.
fn parse_readiness(inspect_json: &str) -> Result<bool> {
    let containers: Vec<InspectContainer> =
        serde_json::from_str(inspect_json).context("Failed to parse podman inspect output")?;
    let state = &containers
        .first()
        .context("podman inspect returned no containers")?
        .state;

    let health = state
        .health
        .as_ref()
        .or(state.healthcheck.as_ref())
        .map(|h| h.status.as_str())
        .unwrap_or("");

    Ok(match health {
        "" => state.status == "running",
        status => status == "healthy",
    })
}

#[async_trait]
impl DeployTarget for PodmanDeployTarget {
    async fn start_instance(&self, slot_id: &str, artifact_digest: &str) -> Result<String> {
        let short = Uuid::new_v4().simple().to_string();
        let name = format!("keel-{}-{}", slot_id, &short[..8]);
        let label = format!("{SLOT_LABEL}={slot_id}");

        let mut run = args(["run", "-d", "--name", &name, "--label", &label]);
        run.extend(self.run_args.iter().cloned());
        run.push(layer_image(artifact_digest));

        let id = podman_checked(&run).await?.trim().to_string();
        debug!("Started container {} ({}) for slot {}", name, id, slot_id);
        Ok(id)
    }

    async fn readiness_check(&self, instance: &str) -> Result<bool> {
        let output = podman_checked(&args(["inspect", "--type", "container", instance])).await?;
        parse_readiness(&output)
    }

    async fn stop_instance(&self, instance: &str) -> Result<()> {
        let timeout = self.stop_timeout_secs.to_string();
        let stopped = podman(&args(["stop", "-t", &timeout, instance])).await?;
        if !stopped.success() {
            debug!("podman stop {} failed, forcing removal", instance);
        }
        podman_checked(&args(["rm", "-f", instance])).await?;
        Ok(())
    }

    async fn list_instances(&self, slot_id: &str) -> Result<Vec<String>> {
        let filter = format!("label={SLOT_LABEL}={slot_id}");
        let output = podman_checked(&args([
            "ps",
            "-a",
            "--no-trunc",
            "--filter",
            &filter,
            "--format",
            "{{.ID}}",
        ]))
        .await?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
