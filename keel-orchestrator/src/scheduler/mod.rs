//! Pipeline scheduler
//!
//! The orchestration core. Revisions detected by the poller or announced
//! through the webhook both arrive at [`Scheduler::on_revision`]. Per
//! pipeline the scheduler keeps one active run and a single pending
//! revision slot:
//!
//! - no active run: a run is created and started immediately
//! - active run: the revision becomes the pending one, replacing any older
//!   pending revision (coalescing)
//!
//! When a run finishes, the pending revision (if any) becomes the next run.
//! A pending revision is only a trigger, never a stored run, so a pipeline
//! has at most one queued or running run at any time.
//!
//! Runs from different pipelines execute in parallel, bounded by a worker
//! pool. Stages within a run execute strictly in order.
//!
//! Runs left queued or running by an earlier process are aborted by
//! [`Scheduler::recover`] before new revisions are accepted, and
//! [`Scheduler::shutdown`] aborts active runs and waits for them.

mod alerts;
mod execute;

pub use alerts::AlertLog;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::domain::alert::Alert;
use keel_core::domain::log::{LogEntry, LogLevel};
use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::domain::revision::Revision;
use keel_core::domain::run::{Run, RunId, RunStatus, StageStatus};
use keel_core::dto::pipeline::CreatePipeline;
use keel_core::dto::trigger::TriggerOutcome;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::ImageBuilder;
use crate::config::{Config, RetryPolicy};
use crate::deploy::DeploymentController;
use crate::pipelines::{CatalogError, PipelineCatalog};
use crate::registry::{ArtifactRegistry, PrunePolicy};
use crate::source::{SourceError, SourceProvider};
use crate::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("pipeline {0} not found")]
    UnknownPipeline(String),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} is not active")]
    RunNotActive(RunId),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tuning for the scheduler
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    pub prune: PrunePolicy,
    pub max_parallel_runs: usize,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            retry: config.retry,
            prune: PrunePolicy {
                retention: config.retention,
            },
            max_parallel_runs: config.max_parallel_runs,
        }
    }
}

/// The components a scheduler drives
pub struct Components {
    pub catalog: Arc<PipelineCatalog>,
    pub source: Arc<dyn SourceProvider>,
    pub builder: Arc<ImageBuilder>,
    pub registry: Arc<ArtifactRegistry>,
    pub deployer: Arc<DeploymentController>,
    pub store: Arc<dyn RunStore>,
}

struct ActiveRun {
    run_id: RunId,
    revision_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PipelineState {
    active: Option<ActiveRun>,
    pending: Option<Revision>,
}

/// A run ready to execute
struct Launch {
    definition: PipelineDefinition,
    run: Run,
    revision: Revision,
    cancel: CancellationToken,
}

pub struct Scheduler {
    catalog: Arc<PipelineCatalog>,
    source: Arc<dyn SourceProvider>,
    builder: Arc<ImageBuilder>,
    registry: Arc<ArtifactRegistry>,
    deployer: Arc<DeploymentController>,
    store: Arc<dyn RunStore>,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    pipelines: Mutex<HashMap<String, PipelineState>>,
    observed: Mutex<HashMap<String, String>>,
    alerts: AlertLog,
    drivers: Mutex<JoinSet<()>>,
    closing: CancellationToken,
}

impl Scheduler {
    pub fn new(components: Components, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            catalog: components.catalog,
            source: components.source,
            builder: components.builder,
            registry: components.registry,
            deployer: components.deployer,
            store: components.store,
            config,
            workers: Arc::new(Semaphore::new(config.max_parallel_runs.max(1))),
            pipelines: Mutex::new(HashMap::new()),
            observed: Mutex::new(HashMap::new()),
            alerts: AlertLog::new(),
            drivers: Mutex::new(JoinSet::new()),
            closing: CancellationToken::new(),
        })
    }

    /// Aborts runs a previous process left queued or running
    ///
    /// Nothing executes them any more, and each would otherwise count as
    /// its pipeline's active run. Call before accepting revisions.
    pub async fn recover(&self) -> Result<Vec<RunId>, StoreError> {
        const REASON: &str = "interrupted by orchestrator restart";

        let mut recovered = Vec::new();
        for mut run in self.store.list_active().await? {
            for stage in &mut run.stages {
                if stage.status == StageStatus::Running {
                    if let Err(e) = stage.transition(StageStatus::Failed) {
                        warn!(run_id = run.run_id, stage = %stage.stage_name, "{}", e);
                    }
                    stage.error = Some(REASON.to_string());
                }
            }
            run.skip_pending_stages();
            if let Err(e) = run.transition(RunStatus::Aborted) {
                warn!(run_id = run.run_id, "{}", e);
            }
            run.error = Some(REASON.to_string());
            self.store.update(&run).await?;

            warn!(run_id = run.run_id, pipeline = %run.pipeline, "aborted run interrupted by restart");
            self.log(
                run.run_id,
                LogEntry::new(LogLevel::Warning, format!("Run Aborted: {REASON}")),
            )
            .await;
            recovered.push(run.run_id);
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted runs");
        }
        Ok(recovered)
    }

    /// Stops accepting revisions, aborts active runs and waits for them
    ///
    /// Pending revisions are dropped. Aborted runs still roll back their
    /// deploys and run cleanup before this returns.
    pub async fn shutdown(&self) {
        self.closing.cancel();

        {
            let mut pipelines = self.pipelines.lock().await;
            for (name, state) in pipelines.iter_mut() {
                if let Some(pending) = state.pending.take() {
                    info!(pipeline = %name, revision = %pending.id, "dropping pending revision");
                }
                if let Some(active) = &state.active {
                    info!(pipeline = %name, run_id = active.run_id, "aborting run for shutdown");
                    active.cancel.cancel();
                }
            }
        }

        let mut drivers = std::mem::take(&mut *self.drivers.lock().await);
        while let Some(result) = drivers.join_next().await {
            if let Err(e) = result {
                error!("run driver ended abnormally: {}", e);
            }
        }
        info!("scheduler stopped");
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    pub fn deployer(&self) -> &DeploymentController {
        &self.deployer
    }

    /// Registers a definition and starts watching its source
    pub async fn register_pipeline(
        &self,
        req: CreatePipeline,
    ) -> Result<PipelineDefinition, CatalogError> {
        let definition = self.catalog.register(req).await?;
        if let Some(source) = &definition.source {
            self.source.watch(&definition.name, source).await;
        }
        Ok(definition)
    }

    /// Watches the source of every pipeline already in the catalog
    pub async fn watch_sources(&self) {
        for definition in self.catalog.list().await {
            if let Some(source) = &definition.source {
                self.source.watch(&definition.name, source).await;
            }
        }
    }

    /// Handles a newly detected revision of `pipeline`
    pub async fn on_revision(
        self: &Arc<Self>,
        pipeline: &str,
        revision: Revision,
    ) -> Result<TriggerOutcome, SchedulerError> {
        if self.closing.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let definition = self
            .catalog
            .latest(pipeline)
            .await
            .ok_or_else(|| SchedulerError::UnknownPipeline(pipeline.to_string()))?;

        self.observed
            .lock()
            .await
            .insert(pipeline.to_string(), revision.id.clone());

        let mut pipelines = self.pipelines.lock().await;
        if self.closing.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let state = pipelines.entry(pipeline.to_string()).or_default();

        if let Some(active) = &state.active {
            let already_pending = state
                .pending
                .as_ref()
                .is_some_and(|p| p.id == revision.id);
            if active.revision_id == revision.id || already_pending {
                debug!(pipeline, revision = %revision.id, "revision already scheduled");
                return Ok(TriggerOutcome::Duplicate);
            }

            let active_run = active.run_id;
            if let Some(superseded) = state.pending.replace(revision.clone()) {
                info!(
                    pipeline,
                    superseded = %superseded.id,
                    revision = %revision.id,
                    "pending revision superseded"
                );
            }
            info!(pipeline, revision = %revision.id, active_run, "revision queued behind active run");
            return Ok(TriggerOutcome::Queued);
        }

        let launch = self.create_run(definition, revision).await?;
        let run_id = launch.run.run_id;
        state.active = Some(ActiveRun {
            run_id,
            revision_id: launch.revision.id.clone(),
            cancel: launch.cancel.clone(),
        });

        // Spawned under the pipelines lock so shutdown either sees this run
        // as active or finds its driver in the set.
        let scheduler = Arc::clone(self);
        let mut drivers = self.drivers.lock().await;
        while drivers.try_join_next().is_some() {}
        drivers.spawn(async move { scheduler.drive(launch).await });
        drop(drivers);
        drop(pipelines);

        Ok(TriggerOutcome::Started { run_id })
    }

    /// Executes runs for one pipeline until nothing is pending
    async fn drive(self: Arc<Self>, first: Launch) {
        let pipeline = first.definition.name.clone();
        let mut next = Some(first);

        while let Some(launch) = next.take() {
            self.execute(launch).await;
            next = self.next_launch(&pipeline).await;
        }

        debug!(pipeline = %pipeline, "pipeline idle");
    }

    /// Promotes the pending revision to a run, or releases the active slot
    async fn next_launch(&self, pipeline: &str) -> Option<Launch> {
        loop {
            let revision = {
                let mut pipelines = self.pipelines.lock().await;
                let state = pipelines.entry(pipeline.to_string()).or_default();
                match state.pending.take() {
                    Some(revision) if !self.closing.is_cancelled() => revision,
                    _ => {
                        state.active = None;
                        return None;
                    }
                }
            };

            let Some(definition) = self.catalog.latest(pipeline).await else {
                warn!(pipeline, revision = %revision.id, "pipeline vanished, dropping revision");
                continue;
            };

            match self.create_run(definition, revision).await {
                Ok(launch) => {
                    let mut pipelines = self.pipelines.lock().await;
                    let state = pipelines.entry(pipeline.to_string()).or_default();
                    state.active = Some(ActiveRun {
                        run_id: launch.run.run_id,
                        revision_id: launch.revision.id.clone(),
                        cancel: launch.cancel.clone(),
                    });
                    // Promoted while shutdown was already past this pipeline
                    if self.closing.is_cancelled() {
                        launch.cancel.cancel();
                    }
                    return Some(launch);
                }
                Err(e) => error!(pipeline, "failed to create run: {}", e),
            }
        }
    }

    async fn create_run(
        &self,
        definition: PipelineDefinition,
        revision: Revision,
    ) -> Result<Launch, StoreError> {
        let run_id = self.store.next_run_id().await?;
        let run = Run::new(run_id, &definition, &revision.id);
        self.store.insert(&run).await?;

        info!(
            run_id,
            pipeline = %definition.name,
            revision = %revision.id,
            version = definition.version,
            "run queued"
        );
        self.log(
            run_id,
            LogEntry::new(
                LogLevel::Info,
                format!(
                    "Run queued for revision {} (definition v{})",
                    revision.id, definition.version
                ),
            ),
        )
        .await;

        Ok(Launch {
            definition,
            run,
            revision,
            cancel: CancellationToken::new(),
        })
    }

    /// Asks an active run to stop
    ///
    /// The run becomes `Aborted` once its in-flight stage has wound down.
    pub async fn abort(&self, run_id: RunId) -> Result<(), SchedulerError> {
        let run = self
            .store
            .get(run_id)
            .await?
            .ok_or(SchedulerError::RunNotFound(run_id))?;
        if !run.is_active() {
            return Err(SchedulerError::RunNotActive(run_id));
        }

        let pipelines = self.pipelines.lock().await;
        let active = pipelines
            .get(&run.pipeline)
            .and_then(|s| s.active.as_ref())
            .filter(|a| a.run_id == run_id)
            .ok_or(SchedulerError::RunNotActive(run_id))?;

        active.cancel.cancel();
        info!(run_id, pipeline = %run.pipeline, "abort requested");
        Ok(())
    }

    /// Polls every pipeline's source once
    pub async fn poll_once(self: &Arc<Self>) {
        for definition in self.catalog.list().await {
            let name = definition.name;
            match self.source.latest_revision(&name).await {
                Ok(revision) => {
                    let seen = self.observed.lock().await.get(&name).cloned();
                    if seen.as_deref() == Some(revision.id.as_str()) {
                        continue;
                    }
                    info!(pipeline = %name, revision = %revision.id, "new revision detected");
                    if let Err(e) = self.on_revision(&name, revision).await {
                        warn!(pipeline = %name, "failed to schedule revision: {}", e);
                    }
                }
                Err(SourceError::UnknownPipeline(_)) => {
                    debug!(pipeline = %name, "no source to poll");
                }
                Err(e) => warn!(pipeline = %name, "failed to poll source: {}", e),
            }
        }
    }

    /// Spawns the source poller
    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting source poller (interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => scheduler.poll_once().await,
                }
            }

            info!("Source poller stopped");
        })
    }

    pub async fn run(&self, run_id: RunId) -> Result<Run, SchedulerError> {
        self.store
            .get(run_id)
            .await?
            .ok_or(SchedulerError::RunNotFound(run_id))
    }

    /// Run history of a pipeline, newest first
    pub async fn runs(&self, pipeline: &str) -> Result<Vec<Run>, SchedulerError> {
        if self.catalog.latest(pipeline).await.is_none() {
            return Err(SchedulerError::UnknownPipeline(pipeline.to_string()));
        }
        Ok(self.store.list_by_pipeline(pipeline).await?)
    }

    pub async fn run_logs(&self, run_id: RunId) -> Result<Vec<LogEntry>, SchedulerError> {
        self.run(run_id).await?;
        Ok(self.store.logs(run_id).await?)
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.list().await
    }

    /// Whether the pipeline has neither an active run nor a pending revision
    pub async fn is_idle(&self, pipeline: &str) -> bool {
        self.pipelines
            .lock()
            .await
            .get(pipeline)
            .is_none_or(|s| s.active.is_none() && s.pending.is_none())
    }

    async fn log(&self, run_id: RunId, entry: LogEntry) {
        if let Err(e) = self.store.append_logs(run_id, vec![entry]).await {
            warn!(run_id, "failed to append run log: {}", e);
        }
    }

    async fn save(&self, run: &Run) {
        if let Err(e) = self.store.update(run).await {
            error!(run_id = run.run_id, "failed to persist run: {}", e);
        }
    }
}

#[cfg(test)]
mod tests;
