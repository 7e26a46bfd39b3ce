//! Pipeline catalog
//!
//! Holds every registered version of every pipeline definition. Versions
//! are immutable; registering under an existing name appends version
//! `n + 1` and new runs pick up the latest one.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::dto::pipeline::CreatePipeline;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid pipeline definition: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

pub struct PipelineCatalog {
    store: Arc<dyn RunStore>,
    versions: RwLock<HashMap<String, Vec<PipelineDefinition>>>,
}

impl PipelineCatalog {
    /// Creates a catalog seeded with the definitions already in `store`
    pub async fn load(store: Arc<dyn RunStore>) -> Result<Self> {
        let mut versions: HashMap<String, Vec<PipelineDefinition>> = HashMap::new();
        for definition in store.definitions().await? {
            versions
                .entry(definition.name.clone())
                .or_default()
                .push(definition);
        }
        for list in versions.values_mut() {
            list.sort_by_key(|d| d.version);
        }

        Ok(Self {
            store,
            versions: RwLock::new(versions),
        })
    }

    /// Registers a definition as the next version of its pipeline
    ///
    /// Registering content identical to the latest version returns that
    /// version instead of creating a new one.
    pub async fn register(&self, req: CreatePipeline) -> Result<PipelineDefinition> {
        validate_pipeline_request(&req)?;

        let mut versions = self.versions.write().await;
        let list = versions.entry(req.name.clone()).or_default();

        if let Some(latest) = list.last() {
            if latest.source == req.source && latest.stages == req.stages {
                return Ok(latest.clone());
            }
        }

        let definition = PipelineDefinition {
            name: req.name,
            version: list.last().map_or(1, |d| d.version + 1),
            source: req.source,
            stages: req.stages,
            created_at: Utc::now(),
        };

        self.store.insert_definition(&definition).await?;
        list.push(definition.clone());

        info!(
            pipeline = %definition.name,
            version = definition.version,
            stages = definition.stages.len(),
            "pipeline registered"
        );
        Ok(definition)
    }

    pub async fn latest(&self, name: &str) -> Option<PipelineDefinition> {
        self.versions
            .read()
            .await
            .get(name)
            .and_then(|list| list.last())
            .cloned()
    }

    pub async fn version(&self, name: &str, version: u32) -> Option<PipelineDefinition> {
        self.versions
            .read()
            .await
            .get(name)
            .and_then(|list| list.iter().find(|d| d.version == version))
            .cloned()
    }

    /// Latest version of every pipeline, sorted by name
    pub async fn list(&self) -> Vec<PipelineDefinition> {
        let mut latest: Vec<PipelineDefinition> = self
            .versions
            .read()
            .await
            .values()
            .filter_map(|list| list.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.name.cmp(&b.name));
        latest
    }

    /// Registers every `*.json` definition in `dir`
    pub async fn load_dir(&self, dir: &Path) -> anyhow::Result<Vec<PipelineDefinition>> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read pipelines directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let req: CreatePipeline = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            let definition = self
                .register(req)
                .await
                .with_context(|| format!("Failed to register {}", path.display()))?;
            loaded.push(definition);
        }

        Ok(loaded)
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_pipeline_request(req: &CreatePipeline) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(CatalogError::Validation(
            "Pipeline name cannot be empty".to_string(),
        ));
    }

    if req.name.len() > 255 {
        return Err(CatalogError::Validation(
            "Pipeline name is too long (max 255 characters)".to_string(),
        ));
    }

    if req.stages.is_empty() {
        return Err(CatalogError::Validation(
            "Pipeline must declare at least one stage".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for stage in &req.stages {
        if stage.name.trim().is_empty() {
            return Err(CatalogError::Validation(
                "Stage name cannot be empty".to_string(),
            ));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(CatalogError::Validation(format!(
                "Duplicate stage name '{}'",
                stage.name
            )));
        }
        if stage.timeout_seconds == 0 {
            return Err(CatalogError::Validation(format!(
                "Stage '{}' must have a timeout greater than zero",
                stage.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRunStore;
    use keel_core::domain::pipeline::{ActionKind, StageSpec};

    fn stage(name: &str, action: ActionKind) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            action,
            parameters: serde_json::json!({}),
            retryable: false,
            timeout_seconds: 60,
            continue_on_failure: false,
        }
    }

    fn request(name: &str, stages: Vec<StageSpec>) -> CreatePipeline {
        CreatePipeline {
            name: name.to_string(),
            source: None,
            stages,
        }
    }

    async fn catalog() -> PipelineCatalog {
        PipelineCatalog::load(Arc::new(MemoryRunStore::new()))
            .await
            .unwrap()
    }

    #[test]
    fn test_validate_empty_name() {
        let req = request("", vec![stage("build", ActionKind::Build)]);
        let result = validate_pipeline_request(&req);
        assert!(matches!(result, Err(CatalogError::Validation(_))));
    }

    #[test]
    fn test_validate_duplicate_stage_names() {
        let req = request(
            "app",
            vec![
                stage("build", ActionKind::Build),
                stage("build", ActionKind::Push),
            ],
        );
        let result = validate_pipeline_request(&req);
        assert!(matches!(result, Err(CatalogError::Validation(msg)) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut build = stage("build", ActionKind::Build);
        build.timeout_seconds = 0;
        let result = validate_pipeline_request(&request("app", vec![build]));
        assert!(matches!(result, Err(CatalogError::Validation(_))));
    }

    #[test]
    fn test_validate_no_stages() {
        let result = validate_pipeline_request(&request("app", vec![]));
        assert!(matches!(result, Err(CatalogError::Validation(_))));
    }

    #[tokio::test]
    async fn test_register_creates_versions() {
        let catalog = catalog().await;

        let v1 = catalog
            .register(request("app", vec![stage("build", ActionKind::Build)]))
            .await
            .unwrap();
        let v2 = catalog
            .register(request(
                "app",
                vec![
                    stage("build", ActionKind::Build),
                    stage("deploy", ActionKind::Deploy),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(catalog.latest("app").await.unwrap().version, 2);
        assert_eq!(catalog.version("app", 1).await.unwrap().stages.len(), 1);
        assert!(catalog.latest("other").await.is_none());
    }

    #[tokio::test]
    async fn test_identical_registration_is_not_a_new_version() {
        let catalog = catalog().await;
        let stages = vec![stage("build", ActionKind::Build)];

        catalog.register(request("app", stages.clone())).await.unwrap();
        let again = catalog.register(request("app", stages)).await.unwrap();

        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_load_restores_from_store() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        {
            let catalog = PipelineCatalog::load(store.clone()).await.unwrap();
            catalog
                .register(request("app", vec![stage("build", ActionKind::Build)]))
                .await
                .unwrap();
            catalog
                .register(request("web", vec![stage("deploy", ActionKind::Deploy)]))
                .await
                .unwrap();
        }

        let catalog = PipelineCatalog::load(store).await.unwrap();
        let names: Vec<String> = catalog.list().await.into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["app", "web"]);
    }

    #[tokio::test]
    async fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hello.json"),
            r#"{
                "name": "hello-flask",
                "stages": [
                    { "name": "build", "action": "build",
                      "parameters": { "base_image": "python:3.12-slim" } },
                    { "name": "deploy", "action": "deploy", "parameters": { "slot": "s1" },
                      "timeout_seconds": 60 }
                ]
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a pipeline").unwrap();

        let catalog = catalog().await;
        let loaded = catalog.load_dir(dir.path()).await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "hello-flask");
        assert_eq!(loaded[0].stages[1].timeout_seconds, 60);
    }
}
