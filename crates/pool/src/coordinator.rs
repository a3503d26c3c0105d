//! Dispatches batches of tasks across the registered workers.
//!
//! Each task is bound to one idle worker for the length of a single remote
//! call, so a worker never runs two tasks from this coordinator at once.
//! Results come back as a map keyed by task; a failed task only affects its
//! own entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use schwarm_wire::WireError;

use crate::address::{WorkerAddress, WorkerId};
use crate::error::{PoolError, Result, TaskError};
use crate::handle::{Connector, WorkerHandle};
use crate::spawner::{ProcessHandle, Spawner};
use crate::worker_set::{Lease, WorkerSet};

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    connector: Arc<dyn Connector>,
    spawner: Option<Arc<dyn Spawner>>,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl CoordinatorBuilder {
    /// Start local workers through `spawner` when a local address does not
    /// answer.
    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// How long a spawned worker gets to start answering (default: 10s).
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Delay between connection attempts to a spawned worker (default: 200ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> Coordinator {
        Coordinator {
            workers: Arc::new(WorkerSet::new()),
            state: Mutex::new(State::default()),
            connector: self.connector,
            spawner: self.spawner,
            ready_timeout: self.ready_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

/// Membership changes, shutdown and dispatch admission serialize here.
#[derive(Default)]
struct State {
    shut_down: bool,
    processes: HashMap<WorkerId, Box<dyn ProcessHandle>>,
}

/// Distributes tasks over a dynamic set of remote workers.
///
/// `add_worker`, `remove_worker`, `shutdown` and `map` may be called
/// concurrently from any number of tasks.
pub struct Coordinator {
    workers: Arc<WorkerSet>,
    state: Mutex<State>,
    connector: Arc<dyn Connector>,
    spawner: Option<Arc<dyn Spawner>>,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl Coordinator {
    pub fn builder(connector: Arc<dyn Connector>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            connector,
            spawner: None,
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Coordinator without local auto-spawn.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::builder(connector).build()
    }

    /// Register the worker at `address`.
    ///
    /// Returns `Ok(false)` when it is already registered, or when it answers
    /// but does not accept tasks. A local address that does not answer gets a
    /// freshly spawned worker if a spawner is configured.
    pub async fn add_worker(&self, address: &str) -> Result<bool> {
        let address: WorkerAddress = address.parse()?;
        let id = address.id();

        if self.state.lock().await.shut_down {
            return Err(PoolError::ShutDown);
        }
        if self.workers.contains(&id) {
            debug!(worker = %id, "worker already registered");
            return Ok(false);
        }

        let (handle, process) = match self.connector.connect(&address).await {
            Ok(handle) => (handle, None),
            Err(e) => {
                let (handle, process) = self.start_local(&address, e).await?;
                (handle, Some(process))
            }
        };

        if !self.workers.add(Arc::clone(&handle)).await {
            handle.close();
            if let Some(mut process) = process {
                warn!(worker = %id, "stopping local worker that was not registered");
                process.terminate().await;
            }
            return Ok(false);
        }

        if let Some(mut process) = process {
            let mut state = self.state.lock().await;
            if state.shut_down || !self.workers.contains(&id) {
                // Shutdown or removal already retired the worker but never
                // saw its process.
                process.terminate().await;
            } else if let Some(mut stale) = state.processes.insert(id, process) {
                stale.terminate().await;
            }
        }
        Ok(true)
    }

    async fn start_local(
        &self,
        address: &WorkerAddress,
        cause: PoolError,
    ) -> Result<(Arc<dyn WorkerHandle>, Box<dyn ProcessHandle>)> {
        let unreachable = || PoolError::WorkerUnreachable(address.to_string());
        let spawner = match &self.spawner {
            Some(spawner) if address.is_local() => spawner,
            _ => {
                warn!(worker = %address, error = %cause, "worker unreachable");
                return Err(unreachable());
            }
        };

        info!(worker = %address, error = %cause, "worker unreachable, starting it locally");
        let mut process = spawner.spawn(address).await.map_err(|e| {
            error!(worker = %address, error = %e, "failed to start local worker");
            unreachable()
        })?;

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.connector.connect(address).await {
                Ok(handle) => {
                    info!(worker = %address, pid = ?process.pid(), "local worker is up");
                    return Ok((handle, process));
                }
                Err(e) if Instant::now() >= deadline => {
                    error!(
                        worker = %address,
                        error = %e,
                        timeout_ms = self.ready_timeout.as_millis() as u64,
                        "local worker did not come up"
                    );
                    process.terminate().await;
                    return Err(unreachable());
                }
                Err(_) => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Remove a worker whether idle or busy and ask it to exit.
    ///
    /// Closing the worker cuts off a task in flight on it, which then ends up
    /// as [`TaskError::WorkerUnavailable`]. Returns `false` for unknown ids.
    pub async fn remove_worker(&self, id: &WorkerId) -> bool {
        let mut state = self.state.lock().await;
        let Some(removed) = self.workers.remove(id) else {
            debug!(worker = %id, "remove requested for unknown worker");
            return false;
        };
        if removed.was_busy {
            warn!(worker = %id, "removing worker with a task in flight");
        }
        retire(&removed.handle).await;
        if let Some(mut process) = state.processes.remove(id) {
            process.terminate().await;
        }
        info!(worker = %id, "worker removed");
        true
    }

    /// Shut down every registered worker and stop accepting work.
    ///
    /// Idempotent. Batches still running stop submitting tasks. Tasks already
    /// in flight run to completion and their results are still recorded; a
    /// busy worker is shut down once its task returns.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            debug!("coordinator already shut down");
            return;
        }

        let removed = self.workers.drain();
        let count = removed.len();
        let mut processes: HashMap<WorkerId, Box<dyn ProcessHandle>> =
            state.processes.drain().collect();
        for worker in removed {
            let id = worker.handle.id().clone();
            let process = processes.remove(&id);
            if worker.was_busy {
                info!(worker = %id, "worker shuts down after its in-flight task");
                let workers = Arc::clone(&self.workers);
                tokio::spawn(async move {
                    workers.settled(&id).await;
                    retire(&worker.handle).await;
                    if let Some(mut process) = process {
                        process.terminate().await;
                    }
                });
            } else {
                retire(&worker.handle).await;
                if let Some(mut process) = process {
                    process.terminate().await;
                }
            }
        }
        for (id, mut process) in processes {
            debug!(worker = %id, "stopping local worker process");
            process.terminate().await;
        }
        state.shut_down = true;
        info!(workers = count, "coordinator shut down");
    }

    /// Run every task on some worker and collect the outcomes.
    ///
    /// At most one task runs per worker at a time; tasks beyond the number of
    /// idle workers wait for one to be released. Equal tasks share one entry,
    /// holding whichever completed last. Fails with
    /// [`PoolError::NoWorkersAvailable`] when no worker is idle at the call.
    pub async fn map<T, R>(
        &self,
        tasks: impl IntoIterator<Item = T>,
    ) -> Result<HashMap<T, std::result::Result<R, TaskError>>>
    where
        T: Serialize + Eq + Hash + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        if self.workers.idle_len() == 0 {
            return Err(PoolError::NoWorkersAvailable);
        }

        let tasks: Vec<T> = tasks.into_iter().collect();
        let total = tasks.len();
        let mut results = HashMap::with_capacity(total);
        let mut units = JoinSet::new();
        let started = Instant::now();
        info!(tasks = total, workers = self.workers.len(), "dispatching batch");

        for (submitted, task) in tasks.into_iter().enumerate() {
            if self.state.lock().await.shut_down {
                warn!(submitted, total, "coordinator shut down, not submitting remaining tasks");
                break;
            }
            let payload = match rmp_serde::to_vec(&task) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "task could not be encoded");
                    results.insert(task, Err(TaskError::InvalidTask(e.to_string())));
                    continue;
                }
            };
            let Some(lease) = self.workers.acquire().await else {
                warn!(submitted, total, "no workers left, not submitting remaining tasks");
                break;
            };

            let workers = Arc::clone(&self.workers);
            units.spawn(async move {
                let worker = lease.id().clone();
                let outcome = dispatch::<R>(&workers, lease, payload).await;
                (task, worker, outcome)
            });
        }

        let mut completed = 0usize;
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((task, worker, outcome)) => {
                    completed += 1;
                    match &outcome {
                        Ok(_) => info!(
                            completed,
                            total,
                            worker = %worker,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "task done"
                        ),
                        Err(e) => warn!(
                            completed,
                            total,
                            worker = %worker,
                            error = %e,
                            "task failed"
                        ),
                    }
                    results.insert(task, outcome);
                }
                Err(e) => error!(error = %e, "dispatch unit aborted"),
            }
        }

        info!(
            results = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(results)
    }

    /// The live worker registry.
    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.lock().await.shut_down
    }
}

/// Run one task on the leased worker and hand the worker back.
async fn dispatch<R: DeserializeOwned>(
    workers: &WorkerSet,
    lease: Lease,
    payload: Vec<u8>,
) -> std::result::Result<R, TaskError> {
    let worker = lease.id().clone();
    if !workers.holds(&lease) {
        return Err(TaskError::WorkerUnavailable(worker));
    }

    let reply = lease.handle().run(payload).await;
    let released = workers.release(lease);

    let bytes = match reply {
        // Removing the worker closed its connection under the call.
        Err(PoolError::Wire(WireError::Closed)) if !released => {
            return Err(TaskError::WorkerUnavailable(worker));
        }
        Err(source) => return Err(TaskError::Failed { worker, source }),
        Ok(bytes) => bytes,
    };
    if !released {
        debug!(worker = %worker, "worker left the pool during the call, keeping its result");
    }
    rmp_serde::from_slice(&bytes).map_err(|e| TaskError::Failed {
        worker,
        source: PoolError::Decode(e),
    })
}

async fn retire(handle: &Arc<dyn WorkerHandle>) {
    if let Err(e) = handle.shutdown().await {
        warn!(worker = %handle.id(), error = %e, "failed to ask worker to shut down");
    }
    handle.close();
}
