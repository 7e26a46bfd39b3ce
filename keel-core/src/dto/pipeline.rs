//! Pipeline DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::pipeline::{PipelineDefinition, SourceSpec, StageSpec};

/// Request to register a pipeline definition
///
/// Registering under an existing name creates the next version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub name: String,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    pub stages: Vec<StageSpec>,
}

/// Lightweight pipeline summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub name: String,
    pub version: u32,
    pub stage_count: usize,
    pub repository: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<PipelineDefinition> for PipelineSummary {
    fn from(definition: PipelineDefinition) -> Self {
        Self {
            name: definition.name,
            version: definition.version,
            stage_count: definition.stages.len(),
            repository: definition.source.map(|s| s.repository),
            created_at: definition.created_at,
        }
    }
}
