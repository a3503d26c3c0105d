//! ZeroMQ-backed worker handles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use schwarm_wire::protocol::{self, Capabilities, Pong, RunFailure};
use schwarm_wire::{Message, RequestSender, ZmqRequestClient};

use crate::address::{WorkerAddress, WorkerId};
use crate::error::PoolError;
use crate::handle::{Connector, WorkerHandle};

/// Connects to workers over a DEALER socket and checks they answer a ping.
#[derive(Debug, Clone)]
pub struct ZmqConnector {
    connect_timeout: Duration,
    run_timeout: Option<Duration>,
}

impl ZmqConnector {
    /// `connect_timeout` bounds both socket setup and every liveness probe.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            run_timeout: None,
        }
    }

    /// Give up on a task after `timeout`. Off by default: tasks may run for
    /// as long as they need.
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }
}

impl Default for ZmqConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl Connector for ZmqConnector {
    async fn connect(&self, address: &WorkerAddress) -> Result<Arc<dyn WorkerHandle>, PoolError> {
        let transport = address.transport();
        let client = ZmqRequestClient::connect(&transport, self.connect_timeout)
            .await
            .map_err(|e| {
                debug!(worker = %address, error = %e, "connect failed");
                PoolError::WorkerUnreachable(address.to_string())
            })?;

        let worker = RemoteWorker::new(address.id(), Arc::new(client), self.connect_timeout)
            .with_run_timeout(self.run_timeout);
        if !worker.is_reachable().await {
            worker.close();
            return Err(PoolError::WorkerUnreachable(address.to_string()));
        }
        Ok(Arc::new(worker))
    }
}

/// A worker reached through any [`RequestSender`].
pub struct RemoteWorker {
    id: WorkerId,
    client: Arc<dyn RequestSender>,
    probe_timeout: Duration,
    run_timeout: Option<Duration>,
    capabilities: OnceCell<Option<Capabilities>>,
}

impl RemoteWorker {
    pub fn new(id: WorkerId, client: Arc<dyn RequestSender>, probe_timeout: Duration) -> Self {
        Self {
            id,
            client,
            probe_timeout,
            run_timeout: None,
            capabilities: OnceCell::new(),
        }
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// What the worker reported about itself, asked once.
    pub async fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities
            .get_or_init(|| async {
                match self.describe().await {
                    Ok(caps) => Some(caps),
                    Err(e) => {
                        warn!(worker = %self.id, error = %e, "capability negotiation failed");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    async fn describe(&self) -> Result<Capabilities, PoolError> {
        let request = Message::new(protocol::DESCRIBE, &())?;
        let reply = self.client.request(request, Some(self.probe_timeout)).await?;
        if reply.topic != protocol::DESCRIBE_REPLY {
            return Err(unexpected(&reply));
        }
        Ok(reply.decode()?)
    }
}

#[async_trait]
impl WorkerHandle for RemoteWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn is_reachable(&self) -> bool {
        let request = match Message::new(protocol::PING, &()) {
            Ok(request) => request,
            Err(_) => return false,
        };
        match self.client.request(request, Some(self.probe_timeout)).await {
            Ok(reply) if reply.topic == protocol::PING_REPLY => {
                if let Ok(pong) = reply.decode::<Pong>() {
                    debug!(worker = %self.id, name = %pong.name, "ping answered");
                }
                true
            }
            Ok(reply) => {
                debug!(worker = %self.id, topic = %reply.topic, "unexpected ping reply");
                false
            }
            Err(e) => {
                debug!(worker = %self.id, error = %e, "ping failed");
                false
            }
        }
    }

    async fn is_worker(&self) -> bool {
        self.capabilities().await.is_some_and(|caps| caps.is_worker)
    }

    async fn run(&self, task: Vec<u8>) -> Result<Vec<u8>, PoolError> {
        let reply = self
            .client
            .request(Message::raw(protocol::RUN, task), self.run_timeout)
            .await?;
        match reply.topic.as_str() {
            protocol::RUN_REPLY => Ok(reply.payload),
            protocol::RUN_ERROR | protocol::UNSUPPORTED => {
                let failure: RunFailure = reply.decode()?;
                Err(PoolError::Remote(failure.message))
            }
            _ => Err(unexpected(&reply)),
        }
    }

    async fn shutdown(&self) -> Result<(), PoolError> {
        self.client
            .notify(Message::new(protocol::SHUTDOWN, &())?)
            .await?;
        debug!(worker = %self.id, "shutdown sent");
        Ok(())
    }

    fn close(&self) {
        self.client.close();
    }
}

fn unexpected(reply: &Message) -> PoolError {
    PoolError::Remote(format!("unexpected reply topic '{}'", reply.topic))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use schwarm_wire::WireError;

    use super::*;

    /// Answers requests in-process the way a fib worker would.
    #[derive(Default)]
    struct FakeSender {
        describes: AtomicUsize,
        notified: Mutex<Vec<String>>,
        silent: bool,
        not_a_worker: bool,
    }

    #[async_trait]
    impl RequestSender for FakeSender {
        async fn request(
            &self,
            message: Message,
            timeout: Option<Duration>,
        ) -> Result<Message, WireError> {
            if self.silent {
                return Err(WireError::Timeout(timeout.unwrap_or_default()));
            }
            let cid = message.correlation_id;
            let reply = match message.topic.as_str() {
                protocol::PING => Message::with_correlation(
                    protocol::PING_REPLY,
                    &Pong { name: "worker".into() },
                    cid,
                )?,
                protocol::DESCRIBE => {
                    self.describes.fetch_add(1, Ordering::SeqCst);
                    let caps = Capabilities {
                        is_worker: !self.not_a_worker,
                        kind: "fib".into(),
                    };
                    Message::with_correlation(protocol::DESCRIBE_REPLY, &caps, cid)?
                }
                protocol::RUN => {
                    let n: u64 = message.decode()?;
                    if n == 13 {
                        let failure = RunFailure { message: "unlucky".into() };
                        Message::with_correlation(protocol::RUN_ERROR, &failure, cid)?
                    } else {
                        Message::with_correlation(protocol::RUN_REPLY, &(n * 2), cid)?
                    }
                }
                other => Message::with_correlation(protocol::UNSUPPORTED, &other, cid)?,
            };
            Ok(reply)
        }

        async fn notify(&self, message: Message) -> Result<(), WireError> {
            self.notified.lock().unwrap().push(message.topic);
            Ok(())
        }

        fn close(&self) {}
    }

    fn worker(sender: FakeSender) -> (RemoteWorker, Arc<FakeSender>) {
        let sender = Arc::new(sender);
        let id: WorkerId = "tcp:worker@localhost:21000".parse().unwrap();
        let worker = RemoteWorker::new(id, sender.clone(), Duration::from_millis(100));
        (worker, sender)
    }

    #[tokio::test]
    async fn run_returns_encoded_output() {
        let (worker, _) = worker(FakeSender::default());
        let out = worker.run(rmp_serde::to_vec(&21u64).unwrap()).await.unwrap();
        assert_eq!(rmp_serde::from_slice::<u64>(&out).unwrap(), 42);
    }

    #[tokio::test]
    async fn run_error_becomes_remote_error() {
        let (worker, _) = worker(FakeSender::default());
        let err = worker.run(rmp_serde::to_vec(&13u64).unwrap()).await.unwrap_err();
        match err {
            PoolError::Remote(msg) => assert_eq!(msg, "unlucky"),
            other => panic!("expected Remote, got {other}"),
        }
    }

    #[tokio::test]
    async fn capabilities_are_negotiated_once() {
        let (worker, sender) = worker(FakeSender::default());
        assert!(worker.is_worker().await);
        assert!(worker.is_worker().await);
        assert_eq!(sender.describes.load(Ordering::SeqCst), 1);
        assert_eq!(worker.capabilities().await.unwrap().kind, "fib");
    }

    #[tokio::test]
    async fn peer_without_worker_role_is_rejected() {
        let (worker, _) = worker(FakeSender {
            not_a_worker: true,
            ..Default::default()
        });
        assert!(worker.is_reachable().await);
        assert!(!worker.is_worker().await);
    }

    #[tokio::test]
    async fn silent_peer_is_unreachable() {
        let (worker, _) = worker(FakeSender {
            silent: true,
            ..Default::default()
        });
        assert!(!worker.is_reachable().await);
        assert!(!worker.is_worker().await);
    }

    #[tokio::test]
    async fn shutdown_is_one_way() {
        let (worker, sender) = worker(FakeSender::default());
        worker.shutdown().await.unwrap();
        assert_eq!(
            *sender.notified.lock().unwrap(),
            vec![protocol::SHUTDOWN.to_string()]
        );
    }
}
