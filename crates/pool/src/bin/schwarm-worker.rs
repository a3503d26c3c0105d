//! schwarm-worker: serves one runner at a worker address.
//!
//! Started by hand on compute hosts, or by a coordinator that found a local
//! address unreachable. Exits on a shutdown request, SIGINT or SIGTERM.

use clap::{Parser, ValueEnum};
use tracing::info;

use schwarm_pool::server::shutdown_signal;
use schwarm_pool::{EchoRunner, FibRunner, Runner, SleepRunner, WorkerAddress, WorkerServer};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "schwarm-worker", version, about)]
struct Cli {
    /// Address to serve at, as scheme:name@host:port.
    #[arg(long, env = "SCHWARM_WORKER_URI", default_value = "tcp:worker@localhost:21000")]
    uri: String,

    /// Runner to host.
    #[arg(long, env = "SCHWARM_WORKER_KIND", value_enum, default_value_t = Kind::Fib)]
    kind: Kind,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Fib,
    Echo,
    Sleep,
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
        .init();

    let cli = Cli::parse();
    let address: WorkerAddress = cli.uri.parse()?;

    match cli.kind {
        Kind::Fib => serve(address, FibRunner).await,
        Kind::Echo => serve(address, EchoRunner).await,
        Kind::Sleep => serve(address, SleepRunner).await,
    }
}

async fn serve<R: Runner>(address: WorkerAddress, runner: R) -> anyhow::Result<()> {
    let server = WorkerServer::new(address.name.clone(), runner);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.notify_one();
    });

    info!(worker = %address, "schwarm-worker starting");
    server.serve(&address.transport()).await?;
    Ok(())
}
