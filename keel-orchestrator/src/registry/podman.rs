//! Podman registry backend
//!
//! Artifact content is the layer image `localhost/keel-layer:<digest>`.
//! Uploading tags it as `<registry>/<namespace>:<digest>` and, when a
//! remote registry is configured, pushes that reference with the resolved
//! credential. Without a remote the reference stays in local storage under
//! `localhost/keel/<namespace>`.

use async_trait::async_trait;
use tracing::debug;

use super::{Credential, PushError, RegistryBackend};
use crate::podman::{args, layer_image, podman, podman_checked};

const LOCAL_REGISTRY: &str = "localhost/keel";

#[derive(Debug, Default, Clone)]
pub struct PodmanRegistryBackend {
    /// Remote registry host and path prefix, e.g. `registry.example.com/team`
    remote: Option<String>,
}

impl PodmanRegistryBackend {
    pub fn new(remote: Option<String>) -> Self {
        Self { remote }
    }

    fn reference(&self, namespace: &str, digest: &str) -> String {
        let registry = self.remote.as_deref().unwrap_or(LOCAL_REGISTRY);
        format!(
            "{}/{}:{}",
            registry.trim_end_matches('/'),
            namespace.to_ascii_lowercase(),
            digest
        )
    }
}

#[async_trait]
impl RegistryBackend for PodmanRegistryBackend {
    async fn upload(
        &self,
        namespace: &str,
        digest: &str,
        credential: Option<&Credential>,
    ) -> Result<(), PushError> {
        let reference = self.reference(namespace, digest);

        podman_checked(&args(["tag", &layer_image(digest), &reference]))
            .await
            .map_err(|e| PushError::Network(format!("{e:#}")))?;

        if self.remote.is_none() {
            debug!(reference = %reference, "artifact kept in local storage");
            return Ok(());
        }

        let mut push = args(["push", "--quiet"]);
        if let Some(credential) = credential {
            push.push("--creds".to_string());
            push.push(credential.secret().to_string());
        }
        push.push(reference.clone());

        let output = podman(&push)
            .await
            .map_err(|e| PushError::Network(format!("{e:#}")))?;
        if !output.success() {
            return Err(classify_push_failure(&output.stderr));
        }

        debug!(reference = %reference, "artifact pushed");
        Ok(())
    }

    async fn delete(&self, namespace: &str, digest: &str) -> anyhow::Result<()> {
        podman_checked(&args(["rmi", "--ignore", &self.reference(namespace, digest)])).await?;
        Ok(())
    }
}

/// Rejected credentials are permanent; everything else is worth retrying
fn classify_push_failure(stderr: &str) -> PushError {
    const AUTH: [&str; 4] = [
        "unauthorized",
        "authentication required",
        "access denied",
        "requested access to the resource is denied",
    ];

    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if AUTH.iter().any(|marker| lower.contains(marker)) {
        PushError::Auth(message)
    } else {
        PushError::Network(message)
    }
}
