//! Deployment slot domain model
//!
//! A slot is the identity of one running service instance. It remembers the
//! artifact it runs now and the one it ran before, so a rollback never has
//! to be reconstructed from logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One running instance of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSlot {
    pub slot_id: String,

    /// Digest of the artifact the live instance runs
    pub current_artifact_digest: Option<String>,

    /// Digest that was replaced by the last successful deploy
    pub previous_artifact_digest: Option<String>,

    /// Handle of the live instance on the deploy target
    pub current_instance: Option<String>,

    pub health_status: HealthStatus,

    pub phase: SlotPhase,

    pub updated_at: DateTime<Utc>,
}

impl DeploymentSlot {
    /// Creates an empty slot that has never been deployed to
    pub fn new(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            current_artifact_digest: None,
            previous_artifact_digest: None,
            current_instance: None,
            health_status: HealthStatus::Unknown,
            phase: SlotPhase::Idle,
            updated_at: Utc::now(),
        }
    }

    /// Digests the slot still depends on
    pub fn referenced_digests(&self) -> impl Iterator<Item = &str> {
        self.current_artifact_digest
            .iter()
            .chain(self.previous_artifact_digest.iter())
            .map(String::as_str)
    }
}

/// Last known health of the live instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Position in the deploy state machine
///
/// `Idle -> Deploying -> {Healthy, RollingBack} -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotPhase {
    Idle,
    Deploying,
    Healthy,
    RollingBack,
}

impl std::fmt::Display for SlotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotPhase::Idle => write!(f, "Idle"),
            SlotPhase::Deploying => write!(f, "Deploying"),
            SlotPhase::Healthy => write!(f, "Healthy"),
            SlotPhase::RollingBack => write!(f, "RollingBack"),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "Unknown"),
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_digests() {
        let mut slot = DeploymentSlot::new("s1");
        assert_eq!(slot.referenced_digests().count(), 0);

        slot.current_artifact_digest = Some("d2".to_string());
        slot.previous_artifact_digest = Some("d1".to_string());

        let digests: Vec<&str> = slot.referenced_digests().collect();
        assert_eq!(digests, vec!["d2", "d1"]);
    }
}
