use super::*;

use keel_core::domain::alert::AlertKind;
use keel_core::domain::pipeline::{ActionKind, StageSpec};
use keel_core::domain::run::{RunStatus, StageStatus};
use keel_core::domain::slot::HealthStatus;
use serde_json::json;

use crate::builder::ImageBuilder;
use crate::deploy::DeploymentController;
use crate::registry::{ArtifactRegistry, RegistryError, StaticCredentials};
use crate::source::MemorySourceProvider;
use crate::store::MemoryRunStore;
use crate::testing::{FakeDeployTarget, FakeRegistryBackend, ScriptedStepExecutor};

const APP: &str = "hello-flask";

struct Harness {
    scheduler: Arc<Scheduler>,
    source: Arc<MemorySourceProvider>,
    executor: Arc<ScriptedStepExecutor>,
    builder: Arc<ImageBuilder>,
    target: Arc<FakeDeployTarget>,
    registry: Arc<ArtifactRegistry>,
    backend: Arc<FakeRegistryBackend>,
    deployer: Arc<DeploymentController>,
    store: Arc<MemoryRunStore>,
}

impl Harness {
    async fn new(first_run_id: RunId) -> Self {
        Self::with_store(
            Arc::new(MemoryRunStore::starting_at(first_run_id)),
            Duration::from_secs(86_400),
        )
        .await
    }

    async fn with_store(store: Arc<MemoryRunStore>, retention: Duration) -> Self {
        let source = Arc::new(MemorySourceProvider::new());
        let executor = Arc::new(ScriptedStepExecutor::new());
        let builder = Arc::new(ImageBuilder::new(executor.clone()));
        let target = Arc::new(FakeDeployTarget::new());
        let backend = Arc::new(FakeRegistryBackend::new());
        let registry = Arc::new(ArtifactRegistry::new(
            backend.clone(),
            Arc::new(StaticCredentials::new().with("hub", "ci:token")),
        ));
        let deployer = Arc::new(DeploymentController::new(
            target.clone(),
            Duration::from_millis(500),
        ));
        let catalog = Arc::new(
            PipelineCatalog::load(store.clone() as Arc<dyn RunStore>)
                .await
                .unwrap(),
        );

        let scheduler = Scheduler::new(
            Components {
                catalog,
                source: source.clone(),
                builder: builder.clone(),
                registry: registry.clone(),
                deployer: deployer.clone(),
                store: store.clone(),
            },
            SchedulerConfig {
                retry: RetryPolicy::default(),
                prune: PrunePolicy { retention },
                max_parallel_runs: 4,
            },
        );

        let harness = Self {
            scheduler,
            source,
            executor,
            builder,
            target,
            registry,
            backend,
            deployer,
            store,
        };
        harness.register(APP, default_stages()).await;
        harness
    }

    async fn register(&self, name: &str, stages: Vec<StageSpec>) {
        self.scheduler
            .register_pipeline(CreatePipeline {
                name: name.to_string(),
                source: None,
                stages,
            })
            .await
            .unwrap();
    }

    async fn trigger(&self, revision: &str) -> TriggerOutcome {
        self.trigger_on(APP, revision).await
    }

    async fn trigger_on(&self, pipeline: &str, revision: &str) -> TriggerOutcome {
        let revision = self.source.publish(pipeline, revision).await;
        self.scheduler.on_revision(pipeline, revision).await.unwrap()
    }

    async fn wait_idle(&self, pipeline: &str) {
        while !self.scheduler.is_idle(pipeline).await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn run(&self, run_id: RunId) -> Run {
        self.scheduler.run(run_id).await.unwrap()
    }

    async fn builder_cache_has(&self, digest: &str) -> bool {
        self.builder.cache().get(digest).await.is_some()
    }

    fn stage_statuses(run: &Run) -> Vec<StageStatus> {
        run.stages.iter().map(|s| s.status).collect()
    }
}

fn stage(name: &str, action: ActionKind, parameters: serde_json::Value) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        action,
        parameters,
        retryable: false,
        timeout_seconds: 600,
        continue_on_failure: false,
    }
}

fn default_stages() -> Vec<StageSpec> {
    let mut push = stage(
        "push",
        ActionKind::Push,
        json!({ "tags": ["{run_id}", "latest"], "credential": "hub" }),
    );
    push.retryable = true;
    push.timeout_seconds = 120;

    let mut deploy = stage("deploy", ActionKind::Deploy, json!({ "slot": "s1" }));
    deploy.timeout_seconds = 10;

    vec![
        stage(
            "build",
            ActionKind::Build,
            json!({
                "base_image": "python:3.12-slim",
                "steps": [ { "run": ["pip", "install", "flask"] }, { "run": ["make"] } ]
            }),
        ),
        push,
        deploy,
    ]
}

fn started(outcome: TriggerOutcome) -> RunId {
    match outcome {
        TriggerOutcome::Started { run_id } => run_id,
        other => panic!("expected a started run, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_successful_run_end_state() {
    let h = Harness::new(42).await;
    h.source.publish(APP, "abc123").await;

    h.scheduler.poll_once().await;
    h.wait_idle(APP).await;

    let run = h.run(42).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.revision_id, "abc123");
    assert_eq!(
        Harness::stage_statuses(&run),
        vec![StageStatus::Succeeded; 3]
    );
    assert!(run.started_at.is_some() && run.finished_at.is_some());

    let latest = h.registry.pull(APP, "latest").await.unwrap();
    let by_run = h.registry.pull(APP, "42").await.unwrap();
    assert_eq!(latest.digest, by_run.digest);
    assert_eq!(latest.run_id, 42);

    let slot = h.deployer.slot("s1").await.unwrap();
    assert_eq!(slot.current_artifact_digest.as_deref(), Some(latest.digest.as_str()));
    assert_eq!(slot.health_status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_end_state() {
    let h = Harness::new(41).await;

    let first = started(h.trigger("r0").await);
    h.wait_idle(APP).await;
    assert_eq!(h.run(first).await.status, RunStatus::Succeeded);
    let d0 = h.registry.pull(APP, "latest").await.unwrap().digest;

    h.target.fail_readiness(true);
    let second = started(h.trigger("abc123").await);
    h.wait_idle(APP).await;

    let run = h.run(second).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        Harness::stage_statuses(&run),
        vec![
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Failed
        ]
    );
    assert!(run.stages[2].error.as_deref().unwrap().contains("health check failed"));

    // Slot still runs the previous artifact
    let slot = h.deployer.slot("s1").await.unwrap();
    assert_eq!(slot.current_artifact_digest.as_deref(), Some(d0.as_str()));
    assert_eq!(h.target.running("s1"), vec![d0.clone()]);

    // The new artifact is kept and still referenced by its run tag
    let d1 = h.registry.pull(APP, &second.to_string()).await.unwrap().digest;
    assert_ne!(d1, d0);
    assert!(h.registry.contains_digest(&d1).await);
    assert!(h.registry.refcount(&d1).await >= 1);

    // latest was put back
    assert_eq!(h.registry.pull(APP, "latest").await.unwrap().digest, d0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_deploy_creates_no_latest() {
    let h = Harness::new(42).await;
    h.target.fail_readiness(true);

    let run_id = started(h.trigger("abc123").await);
    h.wait_idle(APP).await;

    assert_eq!(h.run(run_id).await.status, RunStatus::Failed);
    assert!(matches!(
        h.registry.pull(APP, "latest").await,
        Err(RegistryError::TagNotFound { .. })
    ));

    // The artifact stays reachable through its run id tag only
    let kept = h.registry.pull(APP, "42").await.unwrap();
    assert_eq!(kept.run_id, 42);
    assert_eq!(h.registry.refcount(&kept.digest).await, 1);
    let tags: Vec<String> = h
        .registry
        .list_tags(APP)
        .await
        .into_iter()
        .map(|t| t.tag)
        .collect();
    assert_eq!(tags, vec!["42"]);
}

#[tokio::test(start_paused = true)]
async fn test_revisions_coalesce_behind_active_run() {
    let h = Harness::new(1).await;
    h.executor.slow_command("make", Duration::from_secs(30));

    let monitor = {
        let store = h.store.clone();
        tokio::spawn(async move {
            let mut max_active = 0;
            for _ in 0..2_000 {
                let active = store
                    .list_by_pipeline(APP)
                    .await
                    .unwrap()
                    .iter()
                    .filter(|r| r.is_active())
                    .count();
                max_active = max_active.max(active);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            max_active
        })
    };

    let r1 = started(h.trigger("r1").await);
    assert_eq!(h.trigger("r2").await, TriggerOutcome::Queued);
    assert_eq!(h.trigger("r3").await, TriggerOutcome::Queued);
    h.wait_idle(APP).await;

    let runs = h.scheduler.runs(APP).await.unwrap();
    let revisions: Vec<&str> = runs.iter().map(|r| r.revision_id.as_str()).collect();
    assert_eq!(revisions, vec!["r3", "r1"]);
    assert_eq!(runs[1].run_id, r1);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));

    assert!(monitor.await.unwrap() <= 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_revision_is_ignored() {
    let h = Harness::new(1).await;
    h.executor.slow_command("make", Duration::from_secs(30));

    let revision = h.source.publish(APP, "r1").await;
    started(h.scheduler.on_revision(APP, revision.clone()).await.unwrap());
    assert_eq!(
        h.scheduler.on_revision(APP, revision).await.unwrap(),
        TriggerOutcome::Duplicate
    );

    let r2 = h.source.publish(APP, "r2").await;
    assert_eq!(
        h.scheduler.on_revision(APP, r2.clone()).await.unwrap(),
        TriggerOutcome::Queued
    );
    assert_eq!(
        h.scheduler.on_revision(APP, r2).await.unwrap(),
        TriggerOutcome::Duplicate
    );

    h.wait_idle(APP).await;
    assert_eq!(h.scheduler.runs(APP).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_poller_only_reacts_to_new_revisions() {
    let h = Harness::new(1).await;
    h.source.publish(APP, "r1").await;

    h.scheduler.poll_once().await;
    h.wait_idle(APP).await;
    h.scheduler.poll_once().await;
    h.wait_idle(APP).await;

    assert_eq!(h.scheduler.runs(APP).await.unwrap().len(), 1);

    h.source.publish(APP, "r2").await;
    h.scheduler.poll_once().await;
    h.wait_idle(APP).await;
    assert_eq!(h.scheduler.runs(APP).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_build_failure_skips_remaining_stages() {
    let h = Harness::new(1).await;
    h.executor.fail_command("make", 2, "make: *** [all] Error 2");

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        Harness::stage_statuses(&run),
        vec![
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::Skipped
        ]
    );
    assert_eq!(run.stages[0].attempts, 1);
    assert!(h.deployer.slot("s1").await.is_none());
    assert!(h.registry.list_tags(APP).await.is_empty());

    let logs = h.scheduler.run_logs(run_id).await.unwrap();
    assert!(logs.iter().any(|e| e.message.contains("Error 2")));
}

#[tokio::test(start_paused = true)]
async fn test_transient_push_failure_is_retried() {
    let h = Harness::new(1).await;
    h.backend.fail_next_uploads(2);

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.stages[1].attempts, 3);

    // The resolved credential reached the backend
    let uploads = h.backend.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].2.as_deref(), Some("hub"));

    let logs = h.scheduler.run_logs(run_id).await.unwrap();
    let retries = logs
        .iter()
        .filter(|e| e.stage.as_deref() == Some("push") && e.level == LogLevel::Warning)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_exhausted() {
    let h = Harness::new(1).await;
    h.backend.fail_next_uploads(3);

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stages[1].attempts, 3);
    assert_eq!(run.stages[2].status, StageStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_of_non_retryable_stage_is_fatal() {
    let h = Harness::new(1).await;
    let mut stages = default_stages();
    stages[1].retryable = false;
    h.register(APP, stages).await;
    h.backend.fail_next_uploads(1);

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.definition_version, 2);
    assert_eq!(run.stages[1].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_source_outage_is_retried_while_queued() {
    let h = Harness::new(1).await;
    let revision = h.source.publish(APP, "r1").await;
    h.source.fail_next(2);

    let run_id = started(h.scheduler.on_revision(APP, revision).await.unwrap());
    h.wait_idle(APP).await;

    assert_eq!(h.run(run_id).await.status, RunStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_missing_revision_fails_run_and_alerts() {
    let h = Harness::new(1).await;
    let revision = h.source.publish(APP, "gone").await;
    h.source.remove("gone").await;

    let run_id = started(h.scheduler.on_revision(APP, revision).await.unwrap());
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.stages.iter().all(|s| s.status == StageStatus::Skipped));

    let alerts = h.scheduler.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::RevisionNotFound);
    assert_eq!(alerts[0].run_id, Some(run_id));
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_fails_run() {
    let h = Harness::new(1).await;
    let mut stages = default_stages();
    stages[0].timeout_seconds = 5;
    h.register(APP, stages).await;
    h.executor.slow_command("make", Duration::from_secs(60));

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.stages[0].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_abort_in_flight_run() {
    let h = Harness::new(1).await;
    h.executor.hang_command("make");

    let run_id = started(h.trigger("r1").await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.scheduler.abort(run_id).await.unwrap();
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(
        Harness::stage_statuses(&run),
        vec![
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::Skipped
        ]
    );

    assert!(matches!(
        h.scheduler.abort(run_id).await,
        Err(SchedulerError::RunNotActive(_))
    ));
    assert!(matches!(
        h.scheduler.abort(999).await,
        Err(SchedulerError::RunNotFound(999))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_deploy_rolls_back() {
    let h = Harness::new(1).await;
    let mut stages = default_stages();
    stages[2].timeout_seconds = 600;
    h.register(APP, stages).await;

    let first = started(h.trigger("r0").await);
    h.wait_idle(APP).await;
    let before = h.deployer.slot("s1").await.unwrap();

    h.target.fail_readiness(true);
    let run_id = started(h.trigger("r1").await);
    tokio::time::sleep(Duration::from_secs(30)).await;
    h.scheduler.abort(run_id).await.unwrap();
    h.wait_idle(APP).await;

    assert_eq!(h.run(first).await.status, RunStatus::Succeeded);
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.stages[2].status, StageStatus::Failed);

    let after = h.deployer.slot("s1").await.unwrap();
    assert_eq!(after.current_artifact_digest, before.current_artifact_digest);
    assert_eq!(h.target.running("s1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_fatal_stage_failure_continues() {
    let h = Harness::new(1).await;
    let mut stages = default_stages();
    stages[1].parameters = json!({ "tags": ["latest"], "credential": "unknown" });
    stages[1].continue_on_failure = true;
    h.register(APP, stages).await;

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        Harness::stage_statuses(&run),
        vec![
            StageStatus::Succeeded,
            StageStatus::Failed,
            StageStatus::Succeeded
        ]
    );
    assert!(h.deployer.slot("s1").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_parameters_fail_stage() {
    let h = Harness::new(1).await;
    let mut stages = default_stages();
    stages[2].parameters = json!({ "target": "s1" });
    h.register(APP, stages).await;

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.stages[2].error.as_deref().unwrap().contains("invalid stage parameters"));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_does_not_change_outcome() {
    let h = Harness::new(1).await;
    h.source.fail_release(true);

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    assert_eq!(h.run(run_id).await.status, RunStatus::Succeeded);
    let alerts = h.scheduler.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::CleanupFailed);
}

#[tokio::test(start_paused = true)]
async fn test_run_log_records_stage_attempts_and_durations() {
    let h = Harness::new(1).await;
    h.executor.slow_command("make", Duration::from_secs(3));

    let run_id = started(h.trigger("r1").await);
    h.wait_idle(APP).await;

    let logs = h.scheduler.run_logs(run_id).await.unwrap();
    let build_done = logs
        .iter()
        .find(|e| e.stage.as_deref() == Some("build") && e.duration_ms.is_some())
        .unwrap();
    assert_eq!(build_done.attempt, Some(1));
    assert!(build_done.duration_ms.unwrap() >= 3_000);

    let run = h.run(run_id).await;
    assert_eq!(run.stages[0].log_ref, format!("run/{run_id}/stage/build"));
}

#[tokio::test(start_paused = true)]
async fn test_pipelines_run_in_parallel() {
    let h = Harness::new(1).await;
    let mut stages = default_stages();
    stages[2].parameters = json!({ "slot": "s2" });
    h.register("other", stages).await;
    h.executor.slow_command("make", Duration::from_secs(30));

    let start = tokio::time::Instant::now();
    started(h.trigger("r1").await);
    let revision = h.source.publish("other", "o1").await;
    started(h.scheduler.on_revision("other", revision).await.unwrap());

    h.wait_idle(APP).await;
    h.wait_idle("other").await;

    // Both 30s builds overlap
    assert!(start.elapsed() < Duration::from_secs(60));
    assert!(h.deployer.slot("s1").await.is_some());
    assert!(h.deployer.slot("s2").await.is_some());
}

fn latest_only_stages() -> Vec<StageSpec> {
    vec![
        stage(
            "build",
            ActionKind::Build,
            json!({ "base_image": "python:3.12-slim", "steps": [ { "run": ["make"] } ] }),
        ),
        stage("push", ActionKind::Push, json!({ "tags": ["latest"] })),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_removes_layers_of_pruned_artifacts() {
    let h = Harness::with_store(Arc::new(MemoryRunStore::new()), Duration::ZERO).await;
    h.register("web", latest_only_stages()).await;

    let first = started(h.trigger_on("web", "r1").await);
    h.wait_idle("web").await;
    let d1 = h.registry.artifact("web", first).await.unwrap().digest;

    let second = started(h.trigger_on("web", "r2").await);
    h.wait_idle("web").await;
    let d2 = h.registry.pull("web", "latest").await.unwrap().digest;
    assert_eq!(h.run(second).await.status, RunStatus::Succeeded);

    // The first artifact lost its only alias and was pruned with its layers
    assert!(h.registry.artifact("web", first).await.is_none());
    assert_eq!(h.backend.deleted(), vec![("web".to_string(), d1.clone())]);
    let removed = h.executor.removed_layers();
    assert!(removed.contains(&d1));
    assert!(!removed.contains(&d2));
    assert!(h.builder_cache_has(&d2).await);
    assert!(!h.builder_cache_has(&d1).await);
    assert!(h.scheduler.alerts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_layer_removal_failure_raises_alert() {
    let h = Harness::with_store(Arc::new(MemoryRunStore::new()), Duration::ZERO).await;
    h.register("web", latest_only_stages()).await;
    h.executor.fail_removals(true);

    started(h.trigger_on("web", "r1").await);
    h.wait_idle("web").await;
    let second = started(h.trigger_on("web", "r2").await);
    h.wait_idle("web").await;

    assert_eq!(h.run(second).await.status, RunStatus::Succeeded);
    let alerts = h.scheduler.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::CleanupFailed);
    assert_eq!(alerts[0].run_id, Some(second));
}

#[tokio::test(start_paused = true)]
async fn test_recover_aborts_runs_left_by_previous_process() {
    let store = Arc::new(MemoryRunStore::new());
    let definition = PipelineDefinition {
        name: APP.to_string(),
        version: 1,
        source: None,
        stages: default_stages(),
        created_at: chrono::Utc::now(),
    };
    let mut stale = Run::new(store.next_run_id().await.unwrap(), &definition, "r0");
    stale.transition(RunStatus::Running).unwrap();
    stale.stage_mut(0).unwrap().transition(StageStatus::Running).unwrap();
    store.insert(&stale).await.unwrap();

    let h = Harness::with_store(store, Duration::from_secs(86_400)).await;
    assert_eq!(h.scheduler.recover().await.unwrap(), vec![stale.run_id]);

    let recovered = h.run(stale.run_id).await;
    assert_eq!(recovered.status, RunStatus::Aborted);
    assert_eq!(
        Harness::stage_statuses(&recovered),
        vec![
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::Skipped
        ]
    );

    let run_id = started(h.trigger("r1").await);
    let active = h.store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].run_id, run_id);

    h.wait_idle(APP).await;
    assert!(h.scheduler.recover().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_active_runs_and_waits() {
    let h = Harness::new(1).await;
    h.executor.hang_command("make");

    let run_id = started(h.trigger("r1").await);
    assert_eq!(h.trigger("r2").await, TriggerOutcome::Queued);
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.scheduler.shutdown().await;

    assert_eq!(h.run(run_id).await.status, RunStatus::Aborted);
    assert!(h.store.list_active().await.unwrap().is_empty());
    assert_eq!(h.scheduler.runs(APP).await.unwrap().len(), 1);
    assert!(h.scheduler.is_idle(APP).await);

    let revision = h.source.publish(APP, "r3").await;
    let err = h.scheduler.on_revision(APP, revision).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ShuttingDown));
}

#[tokio::test]
async fn test_unknown_pipeline_is_rejected() {
    let h = Harness::new(1).await;
    let err = h
        .scheduler
        .on_revision("ghost", Revision::new("r1", None))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownPipeline(_)));
    assert!(h.scheduler.runs("ghost").await.is_err());
}
