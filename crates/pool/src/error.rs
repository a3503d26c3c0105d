use thiserror::Error;

use schwarm_wire::WireError;

use crate::address::WorkerId;

/// Errors raised by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid worker address '{0}', expected scheme:name@host:port")]
    InvalidAddress(String),

    #[error("worker unreachable at {0}")]
    WorkerUnreachable(String),

    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("coordinator has been shut down")]
    ShutDown,

    #[error("worker reported an error: {0}")]
    Remote(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Why a single task has no result. Recorded in the result map, never raised.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("worker {0} was removed before the task completed")]
    WorkerUnavailable(WorkerId),

    #[error("task failed on worker {worker}: {source}")]
    Failed {
        worker: WorkerId,
        #[source]
        source: PoolError,
    },

    #[error("task could not be encoded: {0}")]
    InvalidTask(String),

    #[error("task failed: {0}")]
    Local(String),
}

impl TaskError {
    /// The worker the task was bound to, if it reached one.
    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            Self::WorkerUnavailable(worker) | Self::Failed { worker, .. } => Some(worker),
            Self::InvalidTask(_) | Self::Local(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
