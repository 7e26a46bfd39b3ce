//! Run execution
//!
//! Interprets a pipeline definition against one revision: fetch the
//! snapshot, then run each stage in declared order. Retry and backoff live
//! here and nowhere else; components only report classified errors.

use std::future::Future;
use std::time::Duration;

use keel_core::domain::alert::{Alert, AlertKind};
use keel_core::domain::artifact::{Artifact, short_digest};
use keel_core::domain::error::StageError;
use keel_core::domain::log::{LogEntry, LogLevel};
use keel_core::domain::pipeline::{
    ActionKind, DeployParameters, PipelineDefinition, PushParameters, Recipe, StageSpec,
};
use keel_core::domain::revision::{Revision, Snapshot};
use keel_core::domain::run::{Run, RunId, RunStatus, StageStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Launch, Scheduler};
use crate::registry::AliasChange;

/// What earlier stages of a run hand to later ones
struct RunContext {
    revision: Revision,
    snapshot: Snapshot,
    artifact: Option<Artifact>,
    /// Aliases moved by push stages, first change per tag
    alias_changes: Vec<AliasChange>,
}

impl Scheduler {
    pub(super) async fn execute(&self, launch: Launch) {
        let Launch {
            definition,
            mut run,
            revision,
            cancel,
        } = launch;

        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = self.workers.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.finish(&mut run, RunStatus::Aborted, Some("aborted while queued".into()))
                .await;
            return;
        };

        let snapshot = match self.fetch_snapshot(&mut run, &revision, &cancel).await {
            Ok(snapshot) => snapshot,
            Err(StageError::Aborted) => {
                self.finish(&mut run, RunStatus::Aborted, Some("aborted while queued".into()))
                    .await;
                return;
            }
            Err(err) => {
                if err.raises_alert() {
                    self.alerts
                        .raise(Alert::new(
                            &run.pipeline,
                            Some(run.run_id),
                            AlertKind::RevisionNotFound,
                            format!("{err}"),
                        ))
                        .await;
                }
                self.finish(&mut run, RunStatus::Failed, Some(err.to_string()))
                    .await;
                return;
            }
        };

        if let Err(e) = run.transition(RunStatus::Running) {
            warn!(run_id = run.run_id, "{}", e);
        }
        self.save(&run).await;
        info!(run_id = run.run_id, pipeline = %run.pipeline, revision = %revision.id, "run started");
        self.log(
            run.run_id,
            LogEntry::new(LogLevel::Info, format!("Run started on {}", revision.short_id())),
        )
        .await;

        let mut ctx = RunContext {
            revision,
            snapshot,
            artifact: None,
            alias_changes: Vec::new(),
        };

        let (status, error) = self
            .run_stages(&definition, &mut run, &mut ctx, &cancel)
            .await;

        if status != RunStatus::Succeeded {
            self.restore_aliases(&run, &ctx.alias_changes).await;
        }
        self.finish(&mut run, status, error).await;
        self.cleanup(&run, &ctx.snapshot).await;
    }

    /// Runs every stage in order, returning the run's terminal status
    async fn run_stages(
        &self,
        definition: &PipelineDefinition,
        run: &mut Run,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> (RunStatus, Option<String>) {
        for (index, spec) in definition.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return (RunStatus::Aborted, Some("aborted".into()));
            }

            match self.run_stage(definition, run, index, spec, ctx, cancel).await {
                Ok(()) => self.set_stage(run, index, StageStatus::Succeeded, None),
                Err(StageError::Aborted) => {
                    self.set_stage(run, index, StageStatus::Failed, Some("aborted".into()));
                    return (RunStatus::Aborted, Some("aborted".into()));
                }
                Err(err) => {
                    self.set_stage(run, index, StageStatus::Failed, Some(err.to_string()));
                    if err.raises_alert() {
                        self.alerts
                            .raise(Alert::new(
                                &run.pipeline,
                                Some(run.run_id),
                                AlertKind::RevisionNotFound,
                                err.to_string(),
                            ))
                            .await;
                    }

                    if spec.continue_on_failure {
                        warn!(run_id = run.run_id, stage = %spec.name, "non-fatal stage failed: {}", err);
                        self.save(run).await;
                        continue;
                    }
                    return (
                        RunStatus::Failed,
                        Some(format!("stage '{}' failed: {}", spec.name, err)),
                    );
                }
            }
            self.save(run).await;
        }

        (RunStatus::Succeeded, None)
    }

    /// Runs one stage, retrying transient failures of retryable stages
    async fn run_stage(
        &self,
        definition: &PipelineDefinition,
        run: &mut Run,
        index: usize,
        spec: &StageSpec,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let run_id = run.run_id;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.set_stage(run, index, StageStatus::Running, None);
            self.save(run).await;

            info!(run_id, stage = %spec.name, action = %spec.action, attempt, "stage started");
            self.log(
                run_id,
                LogEntry::new(LogLevel::Info, format!("Stage '{}' started", spec.name))
                    .for_stage(&spec.name, attempt),
            )
            .await;

            let started = Instant::now();
            let result = self
                .attempt_stage(&definition.name, run_id, spec, attempt, ctx, cancel)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let err = match result {
                Ok(()) => {
                    info!(run_id, stage = %spec.name, attempt, duration_ms, "stage succeeded");
                    self.log(
                        run_id,
                        LogEntry::new(LogLevel::Info, format!("Stage '{}' succeeded", spec.name))
                            .for_stage(&spec.name, attempt)
                            .with_duration_ms(duration_ms),
                    )
                    .await;
                    return Ok(());
                }
                Err(err) => err,
            };

            let retry = spec.retryable
                && err.is_transient()
                && attempt < self.config.retry.max_attempts;

            if !retry {
                warn!(run_id, stage = %spec.name, attempt, duration_ms, "stage failed: {}", err);
                self.log(
                    run_id,
                    LogEntry::new(
                        LogLevel::Error,
                        format!("Stage '{}' failed: {}", spec.name, err),
                    )
                    .for_stage(&spec.name, attempt)
                    .with_duration_ms(duration_ms),
                )
                .await;
                if let StageError::Build { log_tail, .. } = &err {
                    if !log_tail.is_empty() {
                        self.log(
                            run_id,
                            LogEntry::new(LogLevel::Error, log_tail.clone())
                                .for_stage(&spec.name, attempt),
                        )
                        .await;
                    }
                }
                return Err(err);
            }

            let delay = self.config.retry.delay_after(attempt);
            warn!(
                run_id,
                stage = %spec.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient stage failure, retrying: {}",
                err
            );
            self.log(
                run_id,
                LogEntry::new(
                    LogLevel::Warning,
                    format!(
                        "Stage '{}' attempt {} failed: {}; retrying in {}ms",
                        spec.name,
                        attempt,
                        err,
                        delay.as_millis()
                    ),
                )
                .for_stage(&spec.name, attempt)
                .with_duration_ms(duration_ms),
            )
            .await;

            tokio::select! {
                _ = cancel.cancelled() => return Err(StageError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt_stage(
        &self,
        pipeline: &str,
        run_id: RunId,
        spec: &StageSpec,
        attempt: u32,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let limit = Duration::from_secs(spec.timeout_seconds);

        match spec.action {
            ActionKind::Build => {
                let work = self.build_stage(pipeline, run_id, spec, attempt, ctx);
                bounded(limit, cancel, work).await
            }
            ActionKind::Push => {
                let work = self.push_stage(run_id, spec, attempt, ctx);
                bounded(limit, cancel, work).await
            }
            // The controller bounds start and readiness by the stage timeout
            // and turns cancellation into a rollback.
            ActionKind::Deploy => self.deploy_stage(spec, ctx, limit, cancel).await,
        }
    }

    async fn build_stage(
        &self,
        pipeline: &str,
        run_id: RunId,
        spec: &StageSpec,
        attempt: u32,
        ctx: &mut RunContext,
    ) -> Result<(), StageError> {
        let recipe: Recipe = spec
            .parameters_as()
            .map_err(|e| StageError::InvalidParameters(e.to_string()))?;

        let output = self
            .builder
            .build(pipeline, run_id, &ctx.snapshot, &recipe)
            .await?;

        self.log(
            run_id,
            LogEntry::new(
                LogLevel::Info,
                format!(
                    "Built {} ({} layers cached, {} executed)",
                    output.artifact.short_digest(),
                    output.cached_layers,
                    output.executed_layers
                ),
            )
            .for_stage(&spec.name, attempt),
        )
        .await;

        ctx.artifact = Some(output.artifact);
        Ok(())
    }

    async fn push_stage(
        &self,
        run_id: RunId,
        spec: &StageSpec,
        attempt: u32,
        ctx: &mut RunContext,
    ) -> Result<(), StageError> {
        let params: PushParameters = spec
            .parameters_as()
            .map_err(|e| StageError::InvalidParameters(e.to_string()))?;
        let artifact = ctx
            .artifact
            .as_ref()
            .ok_or_else(|| StageError::MissingInput("no artifact has been built".into()))?;

        let tags: Vec<String> = params
            .tags
            .iter()
            .map(|tag| expand_tag(tag, run_id, &ctx.revision))
            .collect();

        let changes = self
            .registry
            .push(artifact, &tags, params.credential.as_deref())
            .await?;

        for change in changes {
            if !ctx.alias_changes.iter().any(|c| c.tag == change.tag) {
                ctx.alias_changes.push(change);
            }
        }

        self.log(
            run_id,
            LogEntry::new(
                LogLevel::Info,
                format!("Pushed {} as {}", artifact.short_digest(), tags.join(", ")),
            )
            .for_stage(&spec.name, attempt),
        )
        .await;
        Ok(())
    }

    async fn deploy_stage(
        &self,
        spec: &StageSpec,
        ctx: &RunContext,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let params: DeployParameters = spec
            .parameters_as()
            .map_err(|e| StageError::InvalidParameters(e.to_string()))?;
        let artifact = ctx
            .artifact
            .as_ref()
            .ok_or_else(|| StageError::MissingInput("no artifact has been built".into()))?;

        self.deployer
            .deploy(&params.slot, &artifact.digest, limit, cancel)
            .await?;
        Ok(())
    }

    /// Fetches the run's snapshot while the run is still queued
    ///
    /// Source outages are always transient, so they are retried with the
    /// same backoff as retryable stages.
    async fn fetch_snapshot(
        &self,
        run: &mut Run,
        revision: &Revision,
        cancel: &CancellationToken,
    ) -> Result<Snapshot, StageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(StageError::Aborted),
                fetched = self.source.fetch_snapshot(&run.pipeline, &revision.id) => fetched,
            };

            let err: StageError = match fetched {
                Ok(snapshot) => {
                    debug!(run_id = run.run_id, digest = short_digest(&snapshot.digest), "snapshot fetched");
                    return Ok(snapshot);
                }
                Err(e) => e.into(),
            };

            if !err.is_transient() || attempt >= self.config.retry.max_attempts {
                self.log(
                    run.run_id,
                    LogEntry::new(LogLevel::Error, format!("Failed to fetch source: {err}")),
                )
                .await;
                return Err(err);
            }

            let delay = self.config.retry.delay_after(attempt);
            warn!(run_id = run.run_id, attempt, "source unavailable, retrying: {}", err);
            self.log(
                run.run_id,
                LogEntry::new(
                    LogLevel::Warning,
                    format!(
                        "Source fetch attempt {attempt} failed: {err}; retrying in {}ms",
                        delay.as_millis()
                    ),
                ),
            )
            .await;

            tokio::select! {
                _ = cancel.cancelled() => return Err(StageError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn set_stage(&self, run: &mut Run, index: usize, to: StageStatus, error: Option<String>) {
        let run_id = run.run_id;
        if let Some(stage) = run.stage_mut(index) {
            if let Err(e) = stage.transition(to) {
                warn!(run_id, stage = %stage.stage_name, "{}", e);
            }
            if error.is_some() {
                stage.error = error;
            }
        }
    }

    /// Records the run's terminal status
    async fn finish(&self, run: &mut Run, status: RunStatus, error: Option<String>) {
        run.skip_pending_stages();
        if let Err(e) = run.transition(status) {
            warn!(run_id = run.run_id, "{}", e);
        }
        run.error = error;
        self.save(run).await;

        let level = match status {
            RunStatus::Succeeded => LogLevel::Info,
            RunStatus::Aborted => LogLevel::Warning,
            _ => LogLevel::Error,
        };
        let message = match &run.error {
            Some(reason) => format!("Run {status}: {reason}"),
            None => format!("Run {status}"),
        };
        self.log(run.run_id, LogEntry::new(level, message)).await;
        info!(run_id = run.run_id, pipeline = %run.pipeline, status = %status, "run finished");
    }

    /// Undoes the alias changes of a run that did not succeed
    ///
    /// Moved aliases point back at their previous artifact. Aliases the run
    /// created are removed, except its own run id tag, which keeps the
    /// artifact referenced.
    async fn restore_aliases(&self, run: &Run, changes: &[AliasChange]) {
        let own_tag = run.run_id.to_string();
        for change in changes.iter().rev() {
            let restored = match change.previous {
                Some(previous) => {
                    self.registry
                        .retag(&run.pipeline, &change.tag, previous)
                        .await
                }
                None if change.tag == own_tag => continue,
                None => self.registry.untag(&run.pipeline, &change.tag).await,
            };
            match restored {
                Ok(()) => debug!(run_id = run.run_id, tag = %change.tag, "alias restored"),
                Err(e) => warn!(run_id = run.run_id, tag = %change.tag, "failed to restore alias: {}", e),
            }
        }
    }

    /// Post-run cleanup; failures raise an alert and never change the run
    ///
    /// Prunes unreferenced artifacts, deletes the layer images only they
    /// used, and releases the run's snapshot.
    async fn cleanup(&self, run: &Run, snapshot: &Snapshot) {
        let live = self.deployer.live_digests().await;
        let report = self.registry.prune(&self.config.prune, &live).await;
        let mut failures = report.failures;

        if !report.released.is_empty() {
            let mut keep = self.registry.digests().await;
            keep.extend(live);
            for digest in &report.released {
                match self.builder.evict(digest, &keep).await {
                    Ok(layers) => debug!(
                        run_id = run.run_id,
                        digest = short_digest(digest),
                        layers = layers.len(),
                        "artifact layers removed"
                    ),
                    Err(e) => failures.push(format!("{e:#}")),
                }
            }
        }

        if !report.removed.is_empty() {
            self.log(
                run.run_id,
                LogEntry::new(
                    LogLevel::Info,
                    format!("Cleanup pruned {} artifacts", report.removed.len()),
                ),
            )
            .await;
        }

        if let Err(e) = self.source.release(snapshot).await {
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            return;
        }
        let reason = failures.join("; ");
        self.log(
            run.run_id,
            LogEntry::new(LogLevel::Warning, format!("Cleanup failed: {reason}")),
        )
        .await;
        self.alerts
            .raise(Alert::new(
                &run.pipeline,
                Some(run.run_id),
                AlertKind::CleanupFailed,
                format!("cleanup after run {} failed: {reason}", run.run_id),
            ))
            .await;
    }
}

/// Bounds stage work by its timeout and the run's cancellation
async fn bounded<F>(limit: Duration, cancel: &CancellationToken, work: F) -> Result<(), StageError>
where
    F: Future<Output = Result<(), StageError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(StageError::Aborted),
        result = tokio::time::timeout(limit, work) => result.unwrap_or(Err(StageError::Timeout {
            seconds: limit.as_secs(),
        })),
    }
}

/// Substitutes `{run_id}` and `{revision}` in a tag
fn expand_tag(tag: &str, run_id: RunId, revision: &Revision) -> String {
    tag.replace("{run_id}", &run_id.to_string())
        .replace("{revision}", revision.short_id())
}
