//! Pipeline domain types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Pipeline definition
///
/// A named, versioned, ordered list of stages. Immutable once registered;
/// editing a pipeline registers a new version under the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    pub stages: Vec<StageSpec>,
    pub created_at: DateTime<Utc>,
}

impl PipelineDefinition {
    /// Looks up a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Where the source for a pipeline lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// One ordered unit of work within a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub action: ActionKind,
    #[serde(default = "empty_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// A failing non-fatal stage does not halt the run
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl StageSpec {
    /// Decodes the stage parameters into the typed form for its action
    pub fn parameters_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.parameters.clone())
    }
}

fn empty_parameters() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

const fn default_timeout_seconds() -> u64 {
    3600
}

/// Kind of work a stage performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Build,
    Push,
    Deploy,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Build => write!(f, "build"),
            ActionKind::Push => write!(f, "push"),
            ActionKind::Deploy => write!(f, "deploy"),
        }
    }
}

/// Parameters of a `build` stage: the recipe
///
/// The snapshot is copied into `workdir` of the base image, the steps run
/// there in order, and the resulting image starts `cmd`. An empty `cmd`
/// keeps the base image's command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub base_image: String,
    #[serde(default)]
    pub steps: Vec<BuildStep>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

fn default_workdir() -> String {
    "/src".to_string()
}

/// One layer-producing step of a recipe
///
/// `env` is ordered so that a step serializes identically every time,
/// which keeps layer cache keys stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub run: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Parameters of a `push` stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushParameters {
    /// Tags to apply; `{run_id}` and `{revision}` are substituted
    pub tags: Vec<String>,
    /// Credential id resolved through the credential store
    #[serde(default)]
    pub credential: Option<String>,
}

/// Parameters of a `deploy` stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParameters {
    pub slot: String,
}
