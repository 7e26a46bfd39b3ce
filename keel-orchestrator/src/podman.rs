//! Podman plumbing
//!
//! Shared helpers for the build executor and the deploy target:
//! - Checking podman availability
//! - Running podman subcommands and capturing their output
//! - Naming layer images and containers
//! - Removing containers that are dropped mid-flight

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Repository under which every build layer is tagged
pub const LAYER_REPOSITORY: &str = "localhost/keel-layer";

/// Label carrying the slot id on deployed containers
pub const SLOT_LABEL: &str = "keel.slot";

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// Captured result of a podman invocation
#[derive(Debug, Clone)]
pub struct PodmanOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl PodmanOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `podman <args>` and captures its output
///
/// A non-zero exit is not an error here; callers decide what it means.
pub async fn podman(args: &[String]) -> Result<PodmanOutput> {
    let output = Command::new("podman")
        .args(args)
        .output()
        .await
        .with_context(|| {
            format!(
                "Failed to execute podman {}",
                args.first().map(String::as_str).unwrap_or("")
            )
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    if !stderr.trim().is_empty() {
        debug!("podman {:?} stderr: {}", args.first(), stderr.trim());
    }

    Ok(PodmanOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Runs `podman <args>` and fails on a non-zero exit
pub async fn podman_checked(args: &[String]) -> Result<String> {
    let output = podman(args).await?;

    if !output.success() {
        anyhow::bail!(
            "podman {} failed: exit_code={}, stderr='{}'",
            args.first().map(String::as_str).unwrap_or(""),
            output.exit_code,
            output.stderr.trim()
        );
    }

    Ok(output.stdout)
}

/// Image reference of a build layer
pub fn layer_image(digest: &str) -> String {
    format!("{LAYER_REPOSITORY}:{digest}")
}

/// Builds an argument vector from string slices
pub fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Force-removes a container when dropped
///
/// Build and deploy futures can be dropped by a timeout or an abort while a
/// container exists; the guard makes sure nothing is left running.
pub struct ContainerGuard {
    name: Option<String>,
}

impl ContainerGuard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// Keeps the container alive past the guard
    pub fn disarm(mut self) -> String {
        self.name.take().unwrap_or_default()
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            debug!("Removing container {}", name);
            let result = std::process::Command::new("podman")
                .arg("rm")
                .arg("-f")
                .arg(&name)
                .output();

            match result {
                Ok(output) if output.status.success() => {}
                Ok(output) => warn!(
                    "Failed to remove container {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("Failed to remove container {}: {}", name, e),
            }
        }
    }
}
