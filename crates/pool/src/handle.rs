//! Collaborator interfaces the coordinator drives workers through.
//!
//! The pool only ever sees a worker as a [`WorkerHandle`]; how the handle
//! talks to the remote process is up to the [`Connector`] that produced it.
//! [`crate::proxy`] provides the ZeroMQ implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::address::{WorkerAddress, WorkerId};
use crate::error::PoolError;

/// A callable reference to one remote worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Identity the worker is registered under.
    fn id(&self) -> &WorkerId;

    /// Whether the worker currently answers a liveness probe.
    async fn is_reachable(&self) -> bool;

    /// Whether the peer accepts tasks. Negotiated once; later calls return
    /// the cached answer.
    async fn is_worker(&self) -> bool;

    /// Execute one MessagePack-encoded task and return the encoded output.
    async fn run(&self, task: Vec<u8>) -> Result<Vec<u8>, PoolError>;

    /// Ask the remote worker to exit. Does not wait for confirmation.
    async fn shutdown(&self) -> Result<(), PoolError>;

    /// Release the local connection to the worker.
    fn close(&self);
}

/// Turns a worker address into a handle.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the worker at `address`.
    ///
    /// Fails with [`PoolError::WorkerUnreachable`] when nothing answers there.
    async fn connect(&self, address: &WorkerAddress) -> Result<Arc<dyn WorkerHandle>, PoolError>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn connect(&self, address: &WorkerAddress) -> Result<Arc<dyn WorkerHandle>, PoolError> {
        (**self).connect(address).await
    }
}
