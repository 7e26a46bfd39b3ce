//! Slot, registry and alert endpoints

use keel_core::domain::alert::Alert;
use keel_core::domain::artifact::{Artifact, TagRef};
use keel_core::domain::slot::DeploymentSlot;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    pub async fn list_slots(&self) -> Result<Vec<DeploymentSlot>> {
        let response = self.client.get(self.url("/slot/list")).send().await?;

        self.handle_response(response).await
    }

    pub async fn get_slot(&self, slot_id: &str) -> Result<DeploymentSlot> {
        let response = self
            .client
            .get(self.url(&format!("/slot/{}", slot_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Swap a slot back to the artifact it ran before
    pub async fn rollback_slot(&self, slot_id: &str) -> Result<DeploymentSlot> {
        let response = self
            .client
            .post(self.url(&format!("/slot/{}/rollback", slot_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn list_tags(&self, namespace: &str) -> Result<Vec<TagRef>> {
        let response = self
            .client
            .get(self.url(&format!("/registry/{}/tags", namespace)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Resolve an alias to the artifact it points at
    pub async fn pull_tag(&self, namespace: &str, tag: &str) -> Result<Artifact> {
        let response = self
            .client
            .get(self.url(&format!("/registry/{}/tags/{}", namespace, tag)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn list_alerts(&self) -> Result<Vec<Alert>> {
        let response = self.client.get(self.url("/alerts")).send().await?;

        self.handle_response(response).await
    }
}
