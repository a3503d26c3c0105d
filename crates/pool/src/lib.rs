pub mod address;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod local;
pub mod proxy;
pub mod runners;
pub mod server;
pub mod spawner;
pub mod worker_set;

pub use address::{Scheme, WorkerAddress, WorkerId};
pub use config::PoolConfig;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{PoolError, Result, TaskError};
pub use handle::{Connector, WorkerHandle};
pub use proxy::{RemoteWorker, ZmqConnector};
pub use runners::{EchoRunner, FibRunner, SleepRunner};
pub use server::{Runner, WorkerServer};
pub use spawner::{CommandSpawner, ProcessHandle, Spawner};
pub use worker_set::{Lease, Removed, WorkerSet};
