//! Starting local worker processes for addresses nobody answers on.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::address::WorkerAddress;
use crate::error::PoolError;

/// A worker process started by a [`Spawner`].
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if the process is still known to be running.
    fn pid(&self) -> Option<u32>;

    /// Stop the process, forcibly if it does not exit in time.
    async fn terminate(&mut self);
}

/// Starts a worker that will serve at a given local address.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, address: &WorkerAddress) -> Result<Box<dyn ProcessHandle>, PoolError>;
}

/// Runs the worker binary as `<binary> --uri <address> --kind <kind>`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    binary: String,
    kind: String,
    env: HashMap<String, String>,
    grace_period: Duration,
}

impl CommandSpawner {
    pub fn new(binary: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            kind: kind.into(),
            env: HashMap::new(),
            grace_period: Duration::from_secs(5),
        }
    }

    /// Extra environment variable for every spawned worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// How long `terminate` waits after SIGTERM before killing (default: 5s).
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

#[async_trait]
impl Spawner for CommandSpawner {
    async fn spawn(&self, address: &WorkerAddress) -> Result<Box<dyn ProcessHandle>, PoolError> {
        let uri = address.to_string();
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--uri", uri.as_str(), "--kind", self.kind.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {e}", self.binary)))?;
        info!(
            worker = %uri,
            binary = %self.binary,
            kind = %self.kind,
            pid = ?child.id(),
            "spawned local worker"
        );

        if let Some(stdout) = child.stdout.take() {
            forward_output(uri.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(uri.clone(), stderr);
        }

        Ok(Box::new(ManagedChild {
            name: uri,
            child,
            grace_period: self.grace_period,
        }))
    }
}

/// Re-emit a child's output lines as log events tagged with the worker.
fn forward_output<R>(worker: String, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "schwarm::worker_output", worker = %worker, "{line}");
        }
    });
}

/// A spawned worker process, killed when dropped.
struct ManagedChild {
    name: String,
    child: Child,
    grace_period: Duration,
}

#[async_trait]
impl ProcessHandle for ManagedChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .output()
                .await;
            info!(worker = %self.name, pid, "sent SIGTERM");
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
            info!(worker = %self.name, pid, "sent kill signal");
        }

        match tokio::time::timeout(self.grace_period, self.child.wait()).await {
            Ok(Ok(status)) => info!(worker = %self.name, %status, "worker process exited"),
            Ok(Err(e)) => warn!(worker = %self.name, error = %e, "failed to wait for worker process"),
            Err(_) => {
                warn!(worker = %self.name, "worker ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(worker = %self.name, error = %e, "failed to kill worker process");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/schwarm-worker", "fib");
        let address = WorkerAddress::tcp("worker", "localhost", 21999);
        match spawner.spawn(&address).await {
            Err(PoolError::Spawn(msg)) => assert!(msg.contains("/nonexistent/schwarm-worker")),
            Err(other) => panic!("expected Spawn error, got {other}"),
            Ok(_) => panic!("spawning a missing binary should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        assert!(child.id().is_some());

        let mut managed = ManagedChild {
            name: "sleeper".into(),
            child,
            grace_period: Duration::from_secs(2),
        };
        tokio::time::timeout(Duration::from_secs(5), managed.terminate())
            .await
            .expect("terminate should finish");
        assert!(managed.child.try_wait().unwrap().is_some());
    }
}
