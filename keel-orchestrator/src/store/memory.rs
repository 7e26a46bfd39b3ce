//! In-memory run store

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use keel_core::domain::log::LogEntry;
use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::domain::run::{Run, RunId};
use tokio::sync::RwLock;

use super::{RunStore, StoreError};

/// Keeps everything in process memory; history is lost on restart
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    next_id: AtomicU64,
    runs: RwLock<BTreeMap<RunId, Run>>,
    logs: RwLock<HashMap<RunId, Vec<LogEntry>>>,
    definitions: RwLock<Vec<PipelineDefinition>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose first allocated run id is `first`
    pub fn starting_at(first: RunId) -> Self {
        Self {
            next_id: AtomicU64::new(first.saturating_sub(1)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn next_run_id(&self) -> Result<RunId, StoreError> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn insert(&self, run: &Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::DuplicateRun(run.run_id));
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update(&self, run: &Run) -> Result<(), StoreError> {
        match self.runs.write().await.get_mut(&run.run_id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(StoreError::RunNotFound(run.run_id)),
        }
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_by_pipeline(&self, pipeline: &str) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .rev()
            .filter(|r| r.pipeline == pipeline)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect())
    }

    async fn append_logs(&self, run_id: RunId, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        self.logs
            .write()
            .await
            .entry(run_id)
            .or_default()
            .extend(entries);
        Ok(())
    }

    async fn logs(&self, run_id: RunId) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .logs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_definition(&self, definition: &PipelineDefinition) -> Result<(), StoreError> {
        self.definitions.write().await.push(definition.clone());
        Ok(())
    }

    async fn definitions(&self) -> Result<Vec<PipelineDefinition>, StoreError> {
        Ok(self.definitions.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::domain::log::LogLevel;
    use keel_core::domain::run::RunStatus;

    fn definition(name: &str) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            version: 1,
            source: None,
            stages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_ids_are_monotonic() {
        let store = MemoryRunStore::new();
        let a = store.next_run_id().await.unwrap();
        let b = store.next_run_id().await.unwrap();
        assert_eq!(a, 1);
        assert!(b > a);

        let store = MemoryRunStore::starting_at(42);
        assert_eq!(store.next_run_id().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_insert_update_get() {
        let store = MemoryRunStore::new();
        let mut run = Run::new(1, &definition("app"), "abc");

        store.insert(&run).await.unwrap();
        assert!(matches!(
            store.insert(&run).await,
            Err(StoreError::DuplicateRun(1))
        ));

        run.transition(RunStatus::Running).unwrap();
        store.update(&run).await.unwrap();
        assert_eq!(
            store.get(1).await.unwrap().unwrap().status,
            RunStatus::Running
        );

        let missing = Run::new(9, &definition("app"), "abc");
        assert!(matches!(
            store.update(&missing).await,
            Err(StoreError::RunNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_list_by_pipeline_newest_first() {
        let store = MemoryRunStore::new();
        for (id, pipeline) in [(1, "app"), (2, "web"), (3, "app")] {
            store
                .insert(&Run::new(id, &definition(pipeline), "abc"))
                .await
                .unwrap();
        }

        let ids: Vec<RunId> = store
            .list_by_pipeline("app")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_list_active_skips_finished_runs() {
        let store = MemoryRunStore::new();
        for id in 1..=3 {
            store
                .insert(&Run::new(id, &definition("app"), "abc"))
                .await
                .unwrap();
        }
        let mut done = store.get(2).await.unwrap().unwrap();
        done.transition(RunStatus::Failed).unwrap();
        store.update(&done).await.unwrap();

        let ids: Vec<RunId> = store
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_logs_append_in_order() {
        let store = MemoryRunStore::new();
        store
            .append_logs(1, vec![LogEntry::new(LogLevel::Info, "one")])
            .await
            .unwrap();
        store
            .append_logs(1, vec![LogEntry::new(LogLevel::Error, "two")])
            .await
            .unwrap();

        let messages: Vec<String> = store
            .logs(1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["one", "two"]);
        assert!(store.logs(2).await.unwrap().is_empty());
    }
}
