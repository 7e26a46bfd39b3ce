//! Deployment controller
//!
//! Replaces the instance running in a slot with one started from a new
//! artifact, following the per-slot state machine
//!
//! ```text
//! Idle -> Deploying -> { Healthy, RollingBack } -> Idle
//! ```
//!
//! The old instance is only stopped once the new one has passed its
//! readiness check. A failed or cancelled deploy stops the new instance and
//! leaves the slot exactly as it was before the attempt.

mod podman;

pub use podman::PodmanDeployTarget;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::domain::artifact::short_digest;
use keel_core::domain::error::StageError;
use keel_core::domain::slot::{DeploymentSlot, HealthStatus, SlotPhase};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where service instances actually run
#[async_trait]
pub trait DeployTarget: Send + Sync {
    /// Starts an instance of `artifact_digest` for `slot_id`, returning its handle
    async fn start_instance(&self, slot_id: &str, artifact_digest: &str) -> anyhow::Result<String>;

    /// Whether the instance is ready to serve
    async fn readiness_check(&self, instance: &str) -> anyhow::Result<bool>;

    async fn stop_instance(&self, instance: &str) -> anyhow::Result<()>;

    /// Handles of every instance belonging to `slot_id`
    async fn list_instances(&self, slot_id: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("failed to start instance: {0}")]
    StartFailed(String),

    #[error("deploy cancelled")]
    Cancelled,
}

impl DeployError {
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<DeployError> for StageError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::Cancelled => StageError::Aborted,
            other => StageError::Deploy {
                reason: other.reason(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RollbackError {
    #[error("slot {0} not found")]
    UnknownSlot(String),

    #[error("slot {0} has no previous artifact to roll back to")]
    NoPrevious(String),

    #[error("rollback failed: {0}")]
    Failed(String),
}

/// Outcome of a successful deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub slot: DeploymentSlot,
    /// The digest was already live; nothing was started or stopped
    pub unchanged: bool,
}

enum Readiness {
    Ready,
    TimedOut,
    Cancelled,
}

pub struct DeploymentController {
    target: Arc<dyn DeployTarget>,
    readiness_interval: Duration,
    rollback_timeout: Duration,
    slots: RwLock<HashMap<String, DeploymentSlot>>,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeploymentController {
    pub fn new(target: Arc<dyn DeployTarget>, readiness_interval: Duration) -> Self {
        Self {
            target,
            readiness_interval,
            rollback_timeout: Duration::from_secs(60),
            slots: RwLock::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    async fn writer(&self, slot_id: &str) -> Arc<Mutex<()>> {
        self.writers
            .lock()
            .await
            .entry(slot_id.to_string())
            .or_default()
            .clone()
    }

    async fn update<F>(&self, slot_id: &str, f: F) -> DeploymentSlot
    where
        F: FnOnce(&mut DeploymentSlot),
    {
        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(slot_id.to_string())
            .or_insert_with(|| DeploymentSlot::new(slot_id));
        f(slot);
        slot.updated_at = Utc::now();
        slot.clone()
    }

    async fn restore(&self, before: DeploymentSlot) {
        self.slots
            .write()
            .await
            .insert(before.slot_id.clone(), before);
    }

    /// Deploys `artifact_digest` into `slot_id`
    ///
    /// Starting the new instance and its readiness check share one
    /// deadline, `timeout` from the call. Cancelling `cancel` while
    /// deploying follows the same path as a failed check.
    pub async fn deploy(
        &self,
        slot_id: &str,
        artifact_digest: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DeployResult, DeployError> {
        let deadline = Instant::now() + timeout;
        let writer = self.writer(slot_id).await;
        let _guard = writer.lock().await;

        let before = self.update(slot_id, |_| {}).await;
        if before.current_artifact_digest.as_deref() == Some(artifact_digest)
            && before.current_instance.is_some()
            && before.health_status == HealthStatus::Healthy
        {
            info!(slot = slot_id, digest = short_digest(artifact_digest), "artifact already live");
            return Ok(DeployResult {
                slot: before,
                unchanged: true,
            });
        }

        info!(slot = slot_id, digest = short_digest(artifact_digest), "deploying");
        self.update(slot_id, |s| s.phase = SlotPhase::Deploying).await;

        let instance = match self.start(slot_id, artifact_digest, deadline, cancel).await {
            Ok(instance) => instance,
            Err(err) => {
                self.restore(before).await;
                return Err(err);
            }
        };

        match self.wait_ready(&instance, deadline, cancel).await {
            Readiness::Ready => {}
            failed => {
                let err = match failed {
                    Readiness::Cancelled => DeployError::Cancelled,
                    _ => DeployError::HealthCheckFailed(format!(
                        "instance not ready within {}s",
                        timeout.as_secs()
                    )),
                };
                warn!(slot = slot_id, instance = %instance, "{}, rolling back", err);
                self.update(slot_id, |s| s.phase = SlotPhase::RollingBack).await;
                if let Err(e) = self.target.stop_instance(&instance).await {
                    warn!(slot = slot_id, instance = %instance, "failed to stop rejected instance: {:#}", e);
                }
                self.restore(before).await;
                return Err(err);
            }
        }

        self.retire_others(slot_id, &instance).await;

        let slot = self
            .update(slot_id, |s| {
                s.previous_artifact_digest = s.current_artifact_digest.take();
                s.current_artifact_digest = Some(artifact_digest.to_string());
                s.current_instance = Some(instance.clone());
                s.health_status = HealthStatus::Healthy;
                s.phase = SlotPhase::Idle;
            })
            .await;

        info!(slot = slot_id, digest = short_digest(artifact_digest), instance = %instance, "deploy healthy");
        Ok(DeployResult {
            slot,
            unchanged: false,
        })
    }

    /// Swaps the slot back to its previous artifact
    ///
    /// Uses the same sequence as a deploy: the previous artifact is started
    /// and checked before the current instance is stopped.
    pub async fn rollback(&self, slot_id: &str) -> Result<DeploymentSlot, RollbackError> {
        let writer = self.writer(slot_id).await;
        let _guard = writer.lock().await;

        let before = self
            .slot(slot_id)
            .await
            .ok_or_else(|| RollbackError::UnknownSlot(slot_id.to_string()))?;
        let previous = before
            .previous_artifact_digest
            .clone()
            .ok_or_else(|| RollbackError::NoPrevious(slot_id.to_string()))?;

        info!(slot = slot_id, digest = short_digest(&previous), "rolling back");
        self.update(slot_id, |s| s.phase = SlotPhase::RollingBack).await;

        let never = CancellationToken::new();
        let deadline = Instant::now() + self.rollback_timeout;
        let instance = match self
            .start(slot_id, &previous, deadline, &never)
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                self.restore(before).await;
                return Err(RollbackError::Failed(e.to_string()));
            }
        };

        if !matches!(
            self.wait_ready(&instance, deadline, &never).await,
            Readiness::Ready
        ) {
            if let Err(e) = self.target.stop_instance(&instance).await {
                warn!(slot = slot_id, instance = %instance, "failed to stop rejected instance: {:#}", e);
            }
            self.restore(before).await;
            return Err(RollbackError::Failed(format!(
                "previous artifact {} did not become ready",
                short_digest(&previous)
            )));
        }

        self.retire_others(slot_id, &instance).await;

        let slot = self
            .update(slot_id, |s| {
                std::mem::swap(&mut s.current_artifact_digest, &mut s.previous_artifact_digest);
                s.current_instance = Some(instance.clone());
                s.health_status = HealthStatus::Healthy;
                s.phase = SlotPhase::Idle;
            })
            .await;

        info!(slot = slot_id, digest = short_digest(&previous), "rollback complete");
        Ok(slot)
    }

    async fn start(
        &self,
        slot_id: &str,
        artifact_digest: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(DeployError::Cancelled),
            started = tokio::time::timeout_at(deadline, self.target.start_instance(slot_id, artifact_digest)) => {
                match started {
                    Ok(Ok(instance)) => {
                        debug!(slot = slot_id, instance = %instance, "instance started");
                        Ok(instance)
                    }
                    Ok(Err(e)) => Err(DeployError::StartFailed(format!("{e:#}"))),
                    Err(_) => Err(DeployError::StartFailed(
                        "start did not complete before the deadline".to_string(),
                    )),
                }
            }
        }
    }

    async fn wait_ready(
        &self,
        instance: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Readiness {
        loop {
            if cancel.is_cancelled() {
                return Readiness::Cancelled;
            }

            match self.target.readiness_check(instance).await {
                Ok(true) => return Readiness::Ready,
                Ok(false) => {}
                Err(e) => debug!(instance, "readiness check errored: {:#}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Readiness::TimedOut;
            }

            let pause = self.readiness_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Stops every instance of the slot except `keep`
    async fn retire_others(&self, slot_id: &str, keep: &str) {
        let mut stale: Vec<String> = match self.target.list_instances(slot_id).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(slot = slot_id, "failed to list instances: {:#}", e);
                Vec::new()
            }
        };
        if let Some(current) = self.slot(slot_id).await.and_then(|s| s.current_instance) {
            if !stale.contains(&current) {
                stale.push(current);
            }
        }

        for instance in stale.into_iter().filter(|i| i != keep) {
            match self.target.stop_instance(&instance).await {
                Ok(()) => debug!(slot = slot_id, instance = %instance, "stopped old instance"),
                Err(e) => warn!(slot = slot_id, instance = %instance, "failed to stop old instance: {:#}", e),
            }
        }
    }

    pub async fn slot(&self, slot_id: &str) -> Option<DeploymentSlot> {
        self.slots.read().await.get(slot_id).cloned()
    }

    /// Every known slot, sorted by id
    pub async fn slots(&self) -> Vec<DeploymentSlot> {
        let mut slots: Vec<DeploymentSlot> = self.slots.read().await.values().cloned().collect();
        slots.sort_by(|a, b| a.slot_id.cmp(&b.slot_id));
        slots
    }

    /// Digests referenced by any slot as current or previous
    pub async fn live_digests(&self) -> HashSet<String> {
        self.slots
            .read()
            .await
            .values()
            .flat_map(|s| s.referenced_digests().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}
