//! Run-related API endpoints

use keel_core::domain::log::LogEntry;
use keel_core::domain::run::{Run, RunId};
use keel_core::dto::run::RunSummary;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Run history of a pipeline, newest first
    pub async fn list_runs(&self, pipeline: &str) -> Result<Vec<RunSummary>> {
        let response = self
            .client
            .get(self.url(&format!("/run/pipeline/{}", pipeline)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run> {
        let response = self
            .client
            .get(self.url(&format!("/run/{}", run_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Ask an active run to stop
    pub async fn abort_run(&self, run_id: RunId) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/run/{}/abort", run_id)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    pub async fn get_run_logs(&self, run_id: RunId) -> Result<Vec<LogEntry>> {
        let response = self
            .client
            .get(self.url(&format!("/run/{}/logs", run_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
