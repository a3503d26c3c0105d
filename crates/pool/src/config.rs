use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::WorkerAddress;
use crate::coordinator::Coordinator;
use crate::error::PoolError;
use crate::proxy::ZmqConnector;
use crate::spawner::CommandSpawner;

// ── Top-level config ────────────────────────────────────────────────

/// Configuration for a coordinator and the workers it may start.
///
/// Parsed from `schwarm.toml`; every field can be overridden through a
/// `SCHWARM_*` environment variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Local auto-spawn of unreachable workers.
    #[serde(default)]
    pub spawn: SpawnConfig,
}

// ── Section configs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Worker addresses (`scheme:name@host:port`) registered at startup.
    #[serde(default)]
    pub workers: Vec<String>,

    /// Socket setup and liveness probe deadline.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-task deadline. Unset means tasks may run indefinitely.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            run_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Worker binary, looked up on `PATH` unless absolute.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Runner the spawned workers host.
    #[serde(default = "default_kind")]
    pub kind: String,

    /// How long a spawned worker gets to answer its first ping.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wait between SIGTERM and SIGKILL when stopping a spawned worker.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Extra environment for spawned workers.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_binary() -> String {
    "schwarm-worker".into()
}

fn default_kind() -> String {
    "fib".into()
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_grace_period_ms() -> u64 {
    5000
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            binary: default_binary(),
            kind: default_kind(),
            ready_timeout_ms: default_ready_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            env: HashMap::new(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────

impl PoolConfig {
    /// Parse from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, PoolError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `SCHWARM_*` overrides from `lookup`. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SCHWARM_WORKERS") {
            self.coordinator.workers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(ms) = lookup("SCHWARM_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.coordinator.connect_timeout_ms = ms;
        }
        if let Some(secs) = lookup("SCHWARM_RUN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.coordinator.run_timeout_secs = Some(secs);
        }
        if let Some(enabled) = lookup("SCHWARM_SPAWN_ENABLED").and_then(|v| v.parse().ok()) {
            self.spawn.enabled = enabled;
        }
        if let Some(v) = lookup("SCHWARM_SPAWN_BINARY") {
            self.spawn.binary = v;
        }
        if let Some(v) = lookup("SCHWARM_SPAWN_KIND") {
            self.spawn.kind = v;
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), PoolError> {
        self.worker_addresses()?;
        if self.coordinator.connect_timeout_ms == 0 {
            return Err(PoolError::Config(
                "coordinator.connect_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.coordinator.run_timeout_secs == Some(0) {
            return Err(PoolError::Config(
                "coordinator.run_timeout_secs must be greater than zero when set".into(),
            ));
        }
        if self.spawn.enabled && self.spawn.binary.trim().is_empty() {
            return Err(PoolError::Config(
                "spawn.binary must be set when spawning is enabled".into(),
            ));
        }
        if self.spawn.poll_interval_ms == 0 {
            return Err(PoolError::Config(
                "spawn.poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Parsed startup worker addresses.
    pub fn worker_addresses(&self) -> Result<Vec<WorkerAddress>, PoolError> {
        self.coordinator.workers.iter().map(|w| w.parse()).collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator.connect_timeout_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.coordinator.run_timeout_secs.map(Duration::from_secs)
    }

    /// A ZeroMQ coordinator wired up as configured. Workers are not added.
    pub fn coordinator(&self) -> Coordinator {
        let connector =
            ZmqConnector::new(self.connect_timeout()).with_run_timeout(self.run_timeout());
        let mut builder = Coordinator::builder(Arc::new(connector));
        if self.spawn.enabled {
            let spawner = self.spawn.env.iter().fold(
                CommandSpawner::new(&self.spawn.binary, &self.spawn.kind)
                    .grace_period(Duration::from_millis(self.spawn.grace_period_ms)),
                |spawner, (k, v)| spawner.env(k, v),
            );
            builder = builder
                .spawner(Arc::new(spawner))
                .ready_timeout(Duration::from_millis(self.spawn.ready_timeout_ms))
                .poll_interval(Duration::from_millis(self.spawn.poll_interval_ms));
        }
        builder.build()
    }
}
