//! schwarm-map: run a batch of tasks and print the result map as JSON.
//!
//! ```text
//! schwarm-map --workers tcp:worker@localhost:21000,tcp:worker@localhost:21001 3 1 4 1 5
//! ```
//!
//! Tasks are JSON values; bare words are taken as strings. With `--mode
//! serial` or `--mode parallel` the batch runs `fib` on this machine instead.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use schwarm_pool::runners::fib;
use schwarm_pool::{local, PoolConfig, TaskError};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "schwarm-map", version, about)]
struct Cli {
    /// Path to schwarm.toml config file.
    #[arg(long, env = "SCHWARM_CONFIG", default_value = "config/schwarm.toml")]
    config: String,

    /// Comma-separated worker addresses, replacing the configured list.
    #[arg(long, value_delimiter = ',')]
    workers: Vec<String>,

    /// Where the batch runs.
    #[arg(long, value_enum, default_value_t = Mode::Distributed)]
    mode: Mode,

    /// Thread count for `--mode parallel`.
    #[arg(long, default_value_t = 4)]
    ncpu: usize,

    /// Leave remote workers running after the batch.
    #[arg(long)]
    keep_workers: bool,

    /// Tasks, one JSON value each.
    #[arg(required = true)]
    tasks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Distributed,
    Serial,
    Parallel,
}

/// A task as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
enum TaskArg {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl TaskArg {
    fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::Text(raw.to_string()))
    }
}

impl fmt::Display for TaskArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let tasks: Vec<TaskArg> = cli.tasks.iter().map(|t| TaskArg::parse(t)).collect();

    let results = match cli.mode {
        Mode::Distributed => run_distributed(&cli, tasks).await?,
        Mode::Serial => local::map_serial(local_fib, tasks),
        Mode::Parallel => local::map_parallel(local_fib, tasks, cli.ncpu)?,
    };

    println!("{}", serde_json::to_string_pretty(&render(results))?);
    Ok(())
}

async fn run_distributed(
    cli: &Cli,
    tasks: Vec<TaskArg>,
) -> anyhow::Result<HashMap<TaskArg, Result<Value, TaskError>>> {
    let mut config = match PoolConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded schwarm config");
            cfg
        }
        Err(e) => {
            warn!(error = %e, path = %cli.config, "failed to load config, using defaults");
            PoolConfig::default()
        }
    };
    if !cli.workers.is_empty() {
        config.coordinator.workers = cli.workers.clone();
    }
    config.validate()?;

    let coordinator = config.coordinator();
    for address in &config.coordinator.workers {
        match coordinator.add_worker(address).await {
            Ok(true) => {}
            Ok(false) => warn!(worker = %address, "worker not added"),
            Err(e) => warn!(worker = %address, error = %e, "skipping worker"),
        }
    }

    let results = coordinator
        .map(tasks)
        .await
        .context("no worker could be registered")?;

    if cli.keep_workers {
        info!(workers = coordinator.len(), "leaving workers running");
    } else {
        coordinator.shutdown().await;
    }
    Ok(results)
}

fn local_fib(task: &TaskArg) -> Result<Value, String> {
    match task {
        TaskArg::Int(n) if *n >= 0 => fib(*n as u64)
            .map(Value::from)
            .ok_or_else(|| format!("fib({n}) overflows u64")),
        other => Err(format!("fib needs a non-negative integer, got '{other}'")),
    }
}

fn render(results: HashMap<TaskArg, Result<Value, TaskError>>) -> BTreeMap<String, Value> {
    results
        .into_iter()
        .map(|(task, outcome)| {
            let value = match outcome {
                Ok(value) => value,
                Err(e) => json!({ "error": e.to_string() }),
            };
            (task.to_string(), value)
        })
        .collect()
}
