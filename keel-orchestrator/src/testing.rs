//! Fakes for the external seams, shared by unit tests

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::domain::pipeline::Recipe;

use crate::builder::{BaseContext, ImageBuilder, StepContext, StepExecutor, StepOutcome};
use crate::config::Config;
use crate::deploy::{DeployTarget, DeploymentController};
use crate::pipelines::PipelineCatalog;
use crate::registry::{
    ArtifactRegistry, Credential, PushError, RegistryBackend, StaticCredentials,
};
use crate::scheduler::{Components, Scheduler, SchedulerConfig};
use crate::source::MemorySourceProvider;
use crate::store::{MemoryRunStore, RunStore};

/// Step executor whose outcomes are scripted per command line
#[derive(Default)]
pub struct ScriptedStepExecutor {
    failures: Mutex<HashMap<String, (i32, String)>>,
    hangs: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    executed: AtomicUsize,
    bases: Mutex<Vec<(String, Option<PathBuf>, String)>>,
    finalized: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    fail_removals: AtomicBool,
}

impl ScriptedStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes steps running `command` exit with `exit_code`
    pub fn fail_command(&self, command: &str, exit_code: i32, log: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(command.to_string(), (exit_code, log.to_string()));
    }

    /// Makes steps running `command` never finish
    pub fn hang_command(&self, command: &str) {
        self.hangs.lock().unwrap().insert(command.to_string());
    }

    /// Makes steps running `command` take `delay`
    pub fn slow_command(&self, command: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(command.to_string(), delay);
    }

    /// Makes every layer removal fail
    pub fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    /// Number of steps actually executed (cache hits excluded)
    pub fn executed_steps(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Base image, snapshot path and workdir of every base layer prepared
    pub fn bases(&self) -> Vec<(String, Option<PathBuf>, String)> {
        self.bases.lock().unwrap().clone()
    }

    /// Layers produced by `finalize`, in order
    pub fn finalized(&self) -> Vec<String> {
        self.finalized.lock().unwrap().clone()
    }

    /// Layers removed, in order
    pub fn removed_layers(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedStepExecutor {
    async fn prepare_base(&self, ctx: BaseContext<'_>) -> anyhow::Result<u64> {
        self.bases.lock().unwrap().push((
            ctx.base_image.to_string(),
            ctx.snapshot.path.clone(),
            ctx.workdir.to_string(),
        ));
        Ok(100)
    }

    async fn run_step(&self, ctx: StepContext<'_>) -> anyhow::Result<StepOutcome> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let command = ctx.step.run.join(" ");

        let delay = self.delays.lock().unwrap().get(&command).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let hangs = self.hangs.lock().unwrap().contains(&command);
        if hangs {
            std::future::pending::<()>().await;
        }

        let failure = self.failures.lock().unwrap().get(&command).cloned();
        Ok(match failure {
            Some((exit_code, log)) => StepOutcome {
                exit_code,
                log,
                size_bytes: 0,
            },
            None => StepOutcome {
                exit_code: 0,
                log: format!("$ {command}\nok"),
                size_bytes: 10,
            },
        })
    }

    async fn finalize(&self, _parent: &str, layer: &str, _recipe: &Recipe) -> anyhow::Result<u64> {
        self.finalized.lock().unwrap().push(layer.to_string());
        Ok(0)
    }

    async fn remove_layer(&self, layer: &str) -> anyhow::Result<()> {
        if self.fail_removals.load(Ordering::SeqCst) {
            anyhow::bail!("image is in use by a container");
        }
        self.removed.lock().unwrap().push(layer.to_string());
        Ok(())
    }
}

/// Registry backend that records uploads and deletions in memory
#[derive(Default)]
pub struct FakeRegistryBackend {
    network_faults: AtomicUsize,
    fail_deletes: AtomicBool,
    uploads: Mutex<Vec<(String, String, Option<String>)>>,
    deleted: Mutex<Vec<(String, String)>>,
}

impl FakeRegistryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` uploads fail with a network error
    pub fn fail_next_uploads(&self, n: usize) {
        self.network_faults.store(n, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Namespace, digest and credential id of every successful upload
    pub fn uploads(&self) -> Vec<(String, String, Option<String>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryBackend for FakeRegistryBackend {
    async fn upload(
        &self,
        namespace: &str,
        digest: &str,
        credential: Option<&Credential>,
    ) -> Result<(), PushError> {
        let faulted = self
            .network_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            return Err(PushError::Network("connection reset by peer".to_string()));
        }

        self.uploads.lock().unwrap().push((
            namespace.to_string(),
            digest.to_string(),
            credential.map(|c| c.id.clone()),
        ));
        Ok(())
    }

    async fn delete(&self, namespace: &str, digest: &str) -> anyhow::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("registry refused delete");
        }
        self.deleted
            .lock()
            .unwrap()
            .push((namespace.to_string(), digest.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeInstance {
    slot: String,
    digest: String,
    running: bool,
}

#[derive(Default)]
struct FakeTargetState {
    instances: HashMap<String, FakeInstance>,
    next_id: usize,
    starts: usize,
    never_ready: HashSet<String>,
    all_unready: bool,
    fail_start: HashSet<String>,
    start_delay: Option<Duration>,
    checks: HashMap<String, usize>,
    max_concurrent: HashMap<String, usize>,
}

/// Deploy target that keeps instances in memory
#[derive(Default)]
pub struct FakeDeployTarget {
    state: Mutex<FakeTargetState>,
}

impl FakeDeployTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances of `digest` never pass readiness
    pub fn never_ready(&self, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .never_ready
            .insert(digest.to_string());
    }

    /// While set, no instance passes readiness
    pub fn fail_readiness(&self, fail: bool) {
        self.state.lock().unwrap().all_unready = fail;
    }

    /// Instances of `digest` fail to start
    pub fn fail_start(&self, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_start
            .insert(digest.to_string());
    }

    /// Every start takes `delay` before the instance exists
    pub fn slow_start(&self, delay: Duration) {
        self.state.lock().unwrap().start_delay = Some(delay);
    }

    /// Digests of the running instances of a slot, sorted
    pub fn running(&self, slot: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut digests: Vec<String> = state
            .instances
            .values()
            .filter(|i| i.running && i.slot == slot)
            .map(|i| i.digest.clone())
            .collect();
        digests.sort();
        digests
    }

    pub fn readiness_checks(&self, digest: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .checks
            .get(digest)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of instances of a slot that ran at the same time
    pub fn max_concurrent(&self, slot: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_concurrent
            .get(slot)
            .copied()
            .unwrap_or(0)
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }
}

#[async_trait]
impl DeployTarget for FakeDeployTarget {
    async fn start_instance(&self, slot_id: &str, artifact_digest: &str) -> anyhow::Result<String> {
        let delay = self.state.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_start.contains(artifact_digest) {
            anyhow::bail!("image {artifact_digest} not found");
        }

        state.next_id += 1;
        state.starts += 1;
        let id = format!("inst-{}", state.next_id);
        state.instances.insert(
            id.clone(),
            FakeInstance {
                slot: slot_id.to_string(),
                digest: artifact_digest.to_string(),
                running: true,
            },
        );

        let running = state
            .instances
            .values()
            .filter(|i| i.running && i.slot == slot_id)
            .count();
        let max = state.max_concurrent.entry(slot_id.to_string()).or_default();
        *max = (*max).max(running);

        Ok(id)
    }

    async fn readiness_check(&self, instance: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        let digest = match state.instances.get(instance) {
            Some(i) if i.running => i.digest.clone(),
            _ => anyhow::bail!("instance {instance} is not running"),
        };
        *state.checks.entry(digest.clone()).or_default() += 1;
        Ok(!state.all_unready && !state.never_ready.contains(&digest))
    }

    async fn stop_instance(&self, instance: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.instances.get_mut(instance) {
            Some(i) => {
                i.running = false;
                Ok(())
            }
            None => anyhow::bail!("no such instance {instance}"),
        }
    }

    async fn list_instances(&self, slot_id: &str) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .iter()
            .filter(|(_, i)| i.running && i.slot == slot_id)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// Scheduler wired to in-memory fakes, with default configuration
pub async fn fake_scheduler() -> (Arc<Scheduler>, Arc<MemorySourceProvider>) {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let source = Arc::new(MemorySourceProvider::new());
    let catalog = PipelineCatalog::load(store.clone()).await.unwrap();

    let scheduler = Scheduler::new(
        Components {
            catalog: Arc::new(catalog),
            source: source.clone(),
            builder: Arc::new(ImageBuilder::new(Arc::new(ScriptedStepExecutor::new()))),
            registry: Arc::new(ArtifactRegistry::new(
                Arc::new(FakeRegistryBackend::new()),
                Arc::new(StaticCredentials::new()),
            )),
            deployer: Arc::new(DeploymentController::new(
                Arc::new(FakeDeployTarget::new()),
                Duration::from_millis(10),
            )),
            store,
        },
        SchedulerConfig::from(&Config::default()),
    );
    (scheduler, source)
}
