use std::sync::Arc;

use anyhow::{Context, Result};
use keel_orchestrator::builder::{ImageBuilder, PodmanStepExecutor};
use keel_orchestrator::config::Config;
use keel_orchestrator::deploy::{DeploymentController, PodmanDeployTarget};
use keel_orchestrator::pipelines::PipelineCatalog;
use keel_orchestrator::registry::{ArtifactRegistry, EnvCredentialStore, PodmanRegistryBackend};
use keel_orchestrator::scheduler::{Components, Scheduler, SchedulerConfig};
use keel_orchestrator::source::GitSourceProvider;
use keel_orchestrator::store::{MemoryRunStore, PgRunStore, RunStore};
use keel_orchestrator::{api, podman};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Orchestrator...");

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;

    podman::check_podman_available().await?;

    let store: Arc<dyn RunStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            Arc::new(
                PgRunStore::connect(url)
                    .await
                    .context("Failed to connect to database")?,
            )
        }
        None => {
            warn!("DATABASE_URL not set, run history is kept in memory");
            Arc::new(MemoryRunStore::new())
        }
    };

    let catalog = PipelineCatalog::load(store.clone())
        .await
        .context("Failed to load pipeline definitions")?;
    if let Some(dir) = &config.pipelines_dir {
        let loaded = catalog.load_dir(dir).await?;
        info!("Loaded {} pipeline definitions from {}", loaded.len(), dir.display());
    }

    let deployer = DeploymentController::new(
        Arc::new(PodmanDeployTarget::new()),
        config.readiness_interval,
    );

    let scheduler = Scheduler::new(
        Components {
            catalog: Arc::new(catalog),
            source: Arc::new(GitSourceProvider::new(config.workspace.clone())),
            builder: Arc::new(ImageBuilder::new(Arc::new(PodmanStepExecutor::new()))),
            registry: Arc::new(ArtifactRegistry::new(
                Arc::new(PodmanRegistryBackend::new(config.registry_url.clone())),
                Arc::new(EnvCredentialStore::new()),
            )),
            deployer: Arc::new(deployer),
            store,
        },
        SchedulerConfig::from(&config),
    );
    let recovered = scheduler
        .recover()
        .await
        .context("Failed to recover interrupted runs")?;
    if !recovered.is_empty() {
        warn!("Aborted {} runs interrupted by the last shutdown", recovered.len());
    }
    scheduler.watch_sources().await;

    let shutdown = CancellationToken::new();
    let poller = scheduler.spawn_poller(config.poll_interval, shutdown.clone());

    let app = api::create_router(scheduler.clone());

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = poller.await {
        warn!("Source poller ended abnormally: {}", e);
    }

    info!("Waiting for active runs to stop...");
    scheduler.shutdown().await;

    info!("Keel Orchestrator stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();
}
