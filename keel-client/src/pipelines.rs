//! Pipeline-related API endpoints

use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::dto::pipeline::{CreatePipeline, PipelineSummary};
use keel_core::dto::trigger::{TriggerOutcome, TriggerRevision};

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Register a definition; an existing name gets a new version
    pub async fn create_pipeline(&self, req: &CreatePipeline) -> Result<PipelineDefinition> {
        let response = self
            .client
            .post(self.url("/pipeline/create"))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Latest version of every pipeline
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let response = self.client.get(self.url("/pipeline/list")).send().await?;

        self.handle_response(response).await
    }

    pub async fn get_pipeline(&self, name: &str) -> Result<PipelineDefinition> {
        let response = self
            .client
            .get(self.url(&format!("/pipeline/{}", name)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Announce a revision for a pipeline, as a source webhook would
    pub async fn trigger(&self, pipeline: &str, req: &TriggerRevision) -> Result<TriggerOutcome> {
        tracing::debug!("Triggering {} at {}", pipeline, req.revision);

        let response = self
            .client
            .post(self.url(&format!("/pipeline/{}/trigger", pipeline)))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }
}
