//! Orchestrator configuration
//!
//! Defines all configurable parameters for the orchestrator including
//! polling, retry backoff, retention and the HTTP listener.

use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to
    pub bind_addr: String,

    /// PostgreSQL URL for run history; in-memory history when unset
    pub database_url: Option<String>,

    /// How often each pipeline's source is polled for a new revision
    pub poll_interval: Duration,

    /// Maximum number of runs executing at once across all pipelines
    pub max_parallel_runs: usize,

    /// Backoff policy for retryable stages
    pub retry: RetryPolicy,

    /// Unreferenced artifacts younger than this are kept by cleanup
    pub retention: Duration,

    /// Period between readiness checks of a new instance
    pub readiness_interval: Duration,

    /// Directory of `*.json` pipeline definitions loaded at startup
    pub pipelines_dir: Option<PathBuf>,

    /// Base directory for source checkouts
    pub workspace: PathBuf,

    /// Remote registry artifacts are pushed to; local storage when unset
    pub registry_url: Option<String>,
}

/// Exponential backoff for retryable stage failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before the next attempt, given the attempt that just failed (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Recognised environment variables (all optional):
    /// - KEEL_BIND_ADDR (default: 0.0.0.0:8080)
    /// - DATABASE_URL (default: unset, in-memory run history)
    /// - KEEL_POLL_INTERVAL (seconds, default: 60)
    /// - KEEL_MAX_PARALLEL_RUNS (default: 4)
    /// - KEEL_RETRY_BASE_MS (default: 2000)
    /// - KEEL_RETRY_CAP_MS (default: 60000)
    /// - KEEL_RETRY_MAX_ATTEMPTS (default: 3)
    /// - KEEL_RETENTION_SECS (default: 86400)
    /// - KEEL_READINESS_INTERVAL_MS (default: 1000)
    /// - KEEL_PIPELINES_DIR (default: unset)
    /// - KEEL_WORKSPACE (default: /tmp/keel)
    /// - KEEL_REGISTRY_URL (default: unset, artifacts stay in local storage)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("KEEL_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.is_empty());

        let poll_interval = env_parse::<u64>("KEEL_POLL_INTERVAL")
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let max_parallel_runs =
            env_parse::<usize>("KEEL_MAX_PARALLEL_RUNS").unwrap_or(defaults.max_parallel_runs);

        let retry = RetryPolicy {
            base: env_parse::<u64>("KEEL_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base),
            cap: env_parse::<u64>("KEEL_RETRY_CAP_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.cap),
            max_attempts: env_parse::<u32>("KEEL_RETRY_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts),
        };

        let retention = env_parse::<u64>("KEEL_RETENTION_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.retention);

        let readiness_interval = env_parse::<u64>("KEEL_READINESS_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.readiness_interval);

        let pipelines_dir = std::env::var("KEEL_PIPELINES_DIR").ok().map(PathBuf::from);

        let workspace = std::env::var("KEEL_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace);

        let registry_url = std::env::var("KEEL_REGISTRY_URL")
            .ok()
            .filter(|s| !s.is_empty());

        Self {
            bind_addr,
            database_url,
            poll_interval,
            max_parallel_runs,
            retry,
            retention,
            readiness_interval,
            pipelines_dir,
            workspace,
            registry_url,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
            }
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.max_parallel_runs == 0 {
            anyhow::bail!("max_parallel_runs must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry max_attempts must be greater than 0");
        }

        if self.retry.base > self.retry.cap {
            anyhow::bail!("retry base must not exceed retry cap");
        }

        if self.readiness_interval.is_zero() {
            anyhow::bail!("readiness_interval must be greater than 0");
        }

        if let Some(url) = &self.registry_url {
            if url.contains("://") {
                anyhow::bail!("KEEL_REGISTRY_URL must be a registry host, not a URL: {url}");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            poll_interval: Duration::from_secs(60),
            max_parallel_runs: 4,
            retry: RetryPolicy::default(),
            retention: Duration::from_secs(24 * 60 * 60),
            readiness_interval: Duration::from_secs(1),
            pipelines_dir: None,
            workspace: PathBuf::from("/tmp/keel"),
            registry_url: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
