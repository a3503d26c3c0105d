//! The worker side: serve one [`Runner`] over a ROUTER socket.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use schwarm_wire::protocol::{self, Capabilities, Pong, RunFailure};
use schwarm_wire::{Message, RequestHandler, Transport, WireError, ZmqRequestServer};

/// The computation a worker performs on each task.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    type Task: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// Short name reported to coordinators.
    fn kind(&self) -> &str;

    /// Execute one task. An `Err` is reported back as the task's failure.
    async fn run(&self, task: Self::Task) -> Result<Self::Output, String>;
}

/// Answers coordinator requests until asked to stop.
///
/// Each `run` request executes on its own task, so probes are answered while
/// a long task is in progress.
pub struct WorkerServer<R: Runner> {
    name: String,
    runner: Arc<R>,
    shutdown: Arc<Notify>,
}

impl<R: Runner> WorkerServer<R> {
    pub fn new(name: impl Into<String>, runner: R) -> Self {
        Self {
            name: name.into(),
            runner: Arc::new(runner),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops [`serve`](Self::serve) with `notify_one`.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Bind `transport` and answer requests until a shutdown request arrives
    /// or the shutdown handle fires.
    pub async fn serve(&self, transport: &Transport) -> Result<(), WireError> {
        let server = Arc::new(ZmqRequestServer::bind(transport).await?);
        info!(
            worker = %self.name,
            kind = self.runner.kind(),
            endpoint = %transport,
            "worker ready to process tasks"
        );

        loop {
            tokio::select! {
                request = server.recv_request() => {
                    let (token, message) = request?;
                    if message.topic == protocol::SHUTDOWN {
                        info!(worker = %self.name, "shutdown requested by coordinator");
                        break;
                    }
                    let server = Arc::clone(&server);
                    let runner = Arc::clone(&self.runner);
                    let name = self.name.clone();
                    tokio::spawn(async move {
                        let reply = answer(&name, runner, message).await;
                        if let Err(e) = server.send_reply(token, reply).await {
                            warn!(worker = %name, error = %e, "failed to send reply");
                        }
                    });
                }
                _ = self.shutdown.notified() => {
                    info!(worker = %self.name, "shutdown signalled");
                    break;
                }
            }
        }

        if let Transport::Ipc(_) = transport {
            let _ = transport.remove_stale_socket();
        }
        info!(worker = %self.name, "worker stopped");
        Ok(())
    }
}

async fn answer<R: Runner>(name: &str, runner: Arc<R>, request: Message) -> Message {
    let cid = request.correlation_id;
    match request.topic.as_str() {
        protocol::PING => encode_reply(
            protocol::PING_REPLY,
            &Pong {
                name: name.to_string(),
            },
            cid,
        ),
        protocol::DESCRIBE => encode_reply(
            protocol::DESCRIBE_REPLY,
            &Capabilities {
                is_worker: true,
                kind: runner.kind().to_string(),
            },
            cid,
        ),
        protocol::RUN => execute(runner, &request).await,
        other => {
            debug!(topic = other, "unsupported request");
            failure(
                protocol::UNSUPPORTED,
                format!("unsupported topic '{other}'"),
                cid,
            )
        }
    }
}

async fn execute<R: Runner>(runner: Arc<R>, request: &Message) -> Message {
    let cid = request.correlation_id;
    let task: R::Task = match request.decode() {
        Ok(task) => task,
        Err(e) => {
            warn!(error = %e, "rejecting undecodable task");
            return failure(protocol::RUN_ERROR, format!("invalid task: {e}"), cid);
        }
    };

    // A panicking runner must still produce a reply, or the caller waits forever.
    let outcome = match tokio::spawn(async move { runner.run(task).await }).await {
        Ok(outcome) => outcome,
        Err(e) => Err(format!("task panicked: {e}")),
    };

    match outcome {
        Ok(output) => match rmp_serde::to_vec(&output) {
            Ok(bytes) => Message::raw_reply(protocol::RUN_REPLY, bytes, cid),
            Err(e) => failure(protocol::RUN_ERROR, format!("output not encodable: {e}"), cid),
        },
        Err(message) => {
            debug!(error = %message, "task failed");
            failure(protocol::RUN_ERROR, message, cid)
        }
    }
}

fn failure(topic: &str, message: String, cid: Uuid) -> Message {
    encode_reply(topic, &RunFailure { message }, cid)
}

fn encode_reply<T: Serialize>(topic: &str, payload: &T, cid: Uuid) -> Message {
    Message::with_correlation(topic, payload, cid).unwrap_or_else(|e| {
        error!(topic, error = %e, "failed to encode reply");
        Message::raw_reply(protocol::RUN_ERROR, Vec::new(), cid)
    })
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Halver;

    #[async_trait]
    impl Runner for Halver {
        type Task = u64;
        type Output = u64;

        fn kind(&self) -> &str {
            "halver"
        }

        async fn run(&self, task: u64) -> Result<u64, String> {
            match task {
                0 => panic!("zero"),
                n if n % 2 == 1 => Err(format!("{n} is odd")),
                n => Ok(n / 2),
            }
        }
    }

    fn run_request(task: &impl Serialize) -> Message {
        Message::new(protocol::RUN, task).unwrap()
    }

    #[tokio::test]
    async fn run_reply_carries_output_and_correlation() {
        let request = run_request(&10u64);
        let reply = answer("w", Arc::new(Halver), request.clone()).await;
        assert_eq!(reply.topic, protocol::RUN_REPLY);
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.decode::<u64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn runner_error_is_reported() {
        let reply = answer("w", Arc::new(Halver), run_request(&7u64)).await;
        assert_eq!(reply.topic, protocol::RUN_ERROR);
        assert_eq!(reply.decode::<RunFailure>().unwrap().message, "7 is odd");
    }

    #[tokio::test]
    async fn runner_panic_is_reported() {
        let reply = answer("w", Arc::new(Halver), run_request(&0u64)).await;
        assert_eq!(reply.topic, protocol::RUN_ERROR);
        assert!(reply
            .decode::<RunFailure>()
            .unwrap()
            .message
            .contains("panicked"));
    }

    #[tokio::test]
    async fn undecodable_task_is_reported() {
        let reply = answer("w", Arc::new(Halver), run_request(&"hi")).await;
        assert_eq!(reply.topic, protocol::RUN_ERROR);
        assert!(reply
            .decode::<RunFailure>()
            .unwrap()
            .message
            .starts_with("invalid task"));
    }

    #[tokio::test]
    async fn probes_answer_with_name_and_kind() {
        let ping = Message::new(protocol::PING, &()).unwrap();
        let reply = answer("fib-0", Arc::new(Halver), ping).await;
        assert_eq!(reply.decode::<Pong>().unwrap().name, "fib-0");

        let describe = Message::new(protocol::DESCRIBE, &()).unwrap();
        let caps: Capabilities = answer("fib-0", Arc::new(Halver), describe)
            .await
            .decode()
            .unwrap();
        assert!(caps.is_worker);
        assert_eq!(caps.kind, "halver");
    }

    #[tokio::test]
    async fn unknown_topic_is_unsupported() {
        let request = Message::new("schwarm.worker.dance", &()).unwrap();
        let reply = answer("w", Arc::new(Halver), request).await;
        assert_eq!(reply.topic, protocol::UNSUPPORTED);
    }
}
