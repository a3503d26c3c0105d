//! Request/reply infrastructure using ZeroMQ DEALER/ROUTER sockets.
//!
//! - [`ZmqRequestClient`] wraps a DEALER socket; the coordinator holds one per worker
//! - [`ZmqRequestServer`] wraps a ROUTER socket; every worker binds one
//! - [`ReplyToken`] is an opaque handle carrying the ZMQ identity frame
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! zeromq-rs ROUTER pushes peer identity as first frame on recv and pops it
//! on send. DEALER sends/receives raw application frames. So:
//! - DEALER sends: `[topic, envelope]`
//! - ROUTER receives: `[identity, topic, envelope]`
//! - ROUTER sends: `[identity, topic, envelope]`
//! - DEALER receives: `[topic, envelope]`
//!
//! Both sides own their socket from a single background task and talk to it
//! over channels, so sends never wait behind a pending receive.

use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::error::WireError;
use crate::message::Message;
use crate::traits::{RequestHandler, RequestSender};
use crate::transport::Transport;

const CHANNEL_CAPACITY: usize = 256;

/// Opaque token carrying the ZMQ routing identity bytes.
///
/// Pass it back to [`ZmqRequestServer::send_reply`] so the reply reaches the
/// DEALER that sent the request.
#[derive(Debug, Clone)]
pub struct ReplyToken {
    identity: Vec<u8>,
}

type PendingMap = HashMap<Uuid, oneshot::Sender<Message>>;

/// Callers waiting for a reply, keyed by correlation id.
///
/// Only ever locked for a map operation, never across an await.
#[derive(Default, Clone)]
struct Pending(Arc<std::sync::Mutex<PendingMap>>);

impl Pending {
    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Split a `[topic, envelope]` frame list (after any routing frames) into a message.
fn decode_frames<'a>(frames: impl Iterator<Item = &'a [u8]>) -> Result<Message, WireError> {
    // Skip empty delimiter frames some peers put before the payload.
    let data: Vec<&[u8]> = frames.skip_while(|f| f.is_empty()).collect();
    if data.len() < 2 {
        return Err(WireError::Transport(format!(
            "expected [topic, envelope], got {} data frames",
            data.len()
        )));
    }
    Ok(Message::from_bytes(data[1])?)
}

/// Frames queued for the DEALER event loop.
struct Outgoing {
    frames: ZmqMessage,
    /// Signalled once the socket has taken the frames.
    sent: Option<oneshot::Sender<()>>,
}

/// ZeroMQ DEALER-socket client for issuing requests and awaiting replies.
pub struct ZmqRequestClient {
    send_tx: mpsc::Sender<Outgoing>,
    pending: Pending,
    loop_handle: JoinHandle<()>,
}

impl ZmqRequestClient {
    /// Connect a DEALER socket to a ROUTER endpoint.
    ///
    /// Fails with [`WireError::Timeout`] when the connection cannot be
    /// established within `timeout`.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport, timeout: Duration) -> Result<Self, WireError> {
        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        debug!(endpoint = %endpoint, "connecting DEALER socket");
        tokio::time::timeout(timeout, socket.connect(&endpoint))
            .await
            .map_err(|_| WireError::Timeout(timeout))??;

        let pending = Pending::default();
        let (send_tx, send_rx) = mpsc::channel::<Outgoing>(CHANNEL_CAPACITY);

        let loop_pending = pending.clone();
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, send_rx, loop_pending).await;
        });

        Ok(Self {
            send_tx,
            pending,
            loop_handle,
        })
    }

    async fn event_loop(
        mut socket: DealerSocket,
        mut send_rx: mpsc::Receiver<Outgoing>,
        pending: Pending,
    ) {
        loop {
            tokio::select! {
                Some(out) = send_rx.recv() => {
                    match socket.send(out.frames).await {
                        Ok(()) => {
                            if let Some(sent) = out.sent {
                                let _ = sent.send(());
                            }
                        }
                        Err(e) => warn!(error = %e, "DEALER send failed"),
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => Self::dispatch_reply(&pending, zmq_msg),
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                else => break,
            }
        }
        // Dropping the senders wakes every caller still waiting on a reply.
        pending.lock().clear();
    }

    /// Route an inbound reply to the caller waiting on its correlation id.
    fn dispatch_reply(pending: &Pending, zmq_msg: ZmqMessage) {
        let message = match decode_frames(zmq_msg.iter().map(|f| f.as_ref())) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to decode reply");
                return;
            }
        };

        let cid = message.correlation_id;
        let waiter = pending.lock().remove(&cid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!(correlation_id = %cid, "reply for unknown correlation_id"),
        }
    }

    /// Serialize the message and hand it to the event loop.
    async fn enqueue_send(
        &self,
        msg: &Message,
        sent: Option<oneshot::Sender<()>>,
    ) -> Result<(), WireError> {
        let envelope_bytes = msg.to_bytes()?;
        let mut frames = ZmqMessage::from(msg.topic.as_str());
        frames.push_back(envelope_bytes.into());

        self.send_tx
            .send(Outgoing { frames, sent })
            .await
            .map_err(|_| WireError::Closed)
    }
}

#[async_trait]
impl RequestSender for ZmqRequestClient {
    async fn request(
        &self,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, WireError> {
        let cid = msg.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(cid, tx);

        if let Err(e) = self.enqueue_send(&msg, None).await {
            self.pending.lock().remove(&cid);
            return Err(e);
        }
        debug!(correlation_id = %cid, topic = %msg.topic, "sent request");

        let reply = match timeout {
            Some(dur) => match tokio::time::timeout(dur, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().remove(&cid);
                    return Err(WireError::Timeout(dur));
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| WireError::Closed)
    }

    /// Returns once the socket has taken the message, so a `close` right
    /// after cannot drop it.
    async fn notify(&self, msg: Message) -> Result<(), WireError> {
        let (sent_tx, sent_rx) = oneshot::channel();
        self.enqueue_send(&msg, Some(sent_tx)).await?;
        sent_rx.await.map_err(|_| WireError::Closed)?;
        debug!(correlation_id = %msg.correlation_id, topic = %msg.topic, "sent one-way message");
        Ok(())
    }

    fn close(&self) {
        self.loop_handle.abort();
        self.pending.lock().clear();
    }
}

impl Drop for ZmqRequestClient {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

/// ZeroMQ ROUTER-socket server for receiving requests and sending replies.
///
/// Requests are handed out through [`RequestHandler::recv_request`]; replies
/// may be sent concurrently from any task holding the server.
pub struct ZmqRequestServer {
    reply_tx: mpsc::Sender<ZmqMessage>,
    requests: Mutex<mpsc::Receiver<(ReplyToken, Message)>>,
    loop_handle: JoinHandle<()>,
}

impl ZmqRequestServer {
    /// Bind a ROUTER socket on the given transport endpoint.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, WireError> {
        transport
            .ensure_ipc_dir()
            .map_err(|e| WireError::Transport(e.to_string()))?;
        transport
            .remove_stale_socket()
            .map_err(|e| WireError::Transport(e.to_string()))?;
        let mut socket = RouterSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding ROUTER socket");
        socket.bind(&endpoint).await?;

        let (reply_tx, reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, reply_rx, request_tx).await;
        });

        Ok(Self {
            reply_tx,
            requests: Mutex::new(request_rx),
            loop_handle,
        })
    }

    async fn event_loop(
        mut socket: RouterSocket,
        mut reply_rx: mpsc::Receiver<ZmqMessage>,
        request_tx: mpsc::Sender<(ReplyToken, Message)>,
    ) {
        loop {
            tokio::select! {
                Some(zmq_msg) = reply_rx.recv() => {
                    if let Err(e) = socket.send(zmq_msg).await {
                        warn!(error = %e, "ROUTER send failed");
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => match Self::decode_request(zmq_msg) {
                            Ok(request) => {
                                if request_tx.send(request).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed request"),
                        },
                        Err(e) => {
                            debug!(error = %e, "ROUTER recv loop ending");
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    }

    /// ROUTER recv frames: `[identity, topic, envelope]`.
    fn decode_request(zmq_msg: ZmqMessage) -> Result<(ReplyToken, Message), WireError> {
        let mut frames = zmq_msg.iter().map(|f| f.as_ref());
        let identity = frames
            .next()
            .ok_or_else(|| WireError::Transport("empty ROUTER message".into()))?
            .to_vec();
        let message = decode_frames(frames)?;

        debug!(
            correlation_id = %message.correlation_id,
            topic = %message.topic,
            "received request"
        );
        Ok((ReplyToken { identity }, message))
    }
}

#[async_trait]
impl RequestHandler for ZmqRequestServer {
    async fn recv_request(&self) -> Result<(ReplyToken, Message), WireError> {
        self.requests.lock().await.recv().await.ok_or(WireError::Closed)
    }

    /// Frames sent: `[identity, topic, envelope]`; ROUTER pops the identity.
    async fn send_reply(&self, token: ReplyToken, reply: Message) -> Result<(), WireError> {
        let envelope_bytes = reply.to_bytes()?;

        let mut zmq_msg = ZmqMessage::from(token.identity);
        zmq_msg.push_back(reply.topic.as_bytes().to_vec().into());
        zmq_msg.push_back(envelope_bytes.into());

        self.reply_tx
            .send(zmq_msg)
            .await
            .map_err(|_| WireError::Closed)?;

        debug!(
            correlation_id = %reply.correlation_id,
            topic = %reply.topic,
            "queued reply"
        );
        Ok(())
    }
}

impl Drop for ZmqRequestServer {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_skip_delimiters() {
        let msg = Message::new("schwarm.worker.ping", &1u8).unwrap();
        let envelope = msg.to_bytes().unwrap();
        let frames: Vec<&[u8]> = vec![b"", b"schwarm.worker.ping", &envelope];

        let decoded = decode_frames(frames.into_iter()).unwrap();
        assert_eq!(decoded.correlation_id, msg.correlation_id);
    }

    #[test]
    fn frames_too_short() {
        let frames: Vec<&[u8]> = vec![b"topic-only"];
        assert!(matches!(
            decode_frames(frames.into_iter()),
            Err(WireError::Transport(_))
        ));
    }
}
