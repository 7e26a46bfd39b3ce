//! Run store
//!
//! Persists pipeline definitions, run history and per-run logs. The
//! scheduler is the only writer of runs; the API reads through the same
//! trait.

mod memory;
mod postgres;

pub use memory::MemoryRunStore;
pub use postgres::PgRunStore;

use async_trait::async_trait;
use keel_core::domain::log::LogEntry;
use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::domain::run::{Run, RunId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} already exists")]
    DuplicateRun(RunId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Allocates the next run id; ids are unique and increase monotonically
    async fn next_run_id(&self) -> Result<RunId, StoreError>;

    async fn insert(&self, run: &Run) -> Result<(), StoreError>;

    /// Replaces the stored copy of an existing run
    async fn update(&self, run: &Run) -> Result<(), StoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    /// Runs of a pipeline, newest first
    async fn list_by_pipeline(&self, pipeline: &str) -> Result<Vec<Run>, StoreError>;

    /// Queued and running runs across all pipelines, oldest first
    async fn list_active(&self) -> Result<Vec<Run>, StoreError>;

    async fn append_logs(&self, run_id: RunId, entries: Vec<LogEntry>) -> Result<(), StoreError>;

    /// Log entries of a run in the order they were appended
    async fn logs(&self, run_id: RunId) -> Result<Vec<LogEntry>, StoreError>;

    async fn insert_definition(&self, definition: &PipelineDefinition) -> Result<(), StoreError>;

    /// Every stored definition version
    async fn definitions(&self) -> Result<Vec<PipelineDefinition>, StoreError>;
}
