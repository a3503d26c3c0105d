use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::WireError;
use crate::message::Message;
use crate::reqrep::ReplyToken;

/// Issues requests to a single remote peer and awaits matching replies.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Send a request and wait for the reply with the same `correlation_id`.
    ///
    /// `None` waits without a deadline.
    async fn request(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, WireError>;

    /// Send a message without waiting for any reply.
    async fn notify(&self, message: Message) -> Result<(), WireError>;

    /// Stop the background connection. Later calls fail with [`WireError::Closed`].
    fn close(&self);
}

#[async_trait]
impl<T: RequestSender + ?Sized> RequestSender for Arc<T> {
    async fn request(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, WireError> {
        (**self).request(message, timeout).await
    }

    async fn notify(&self, message: Message) -> Result<(), WireError> {
        (**self).notify(message).await
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Receives requests from any number of peers and routes replies back.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Receive the next request. Blocks until one arrives.
    async fn recv_request(&self) -> Result<(ReplyToken, Message), WireError>;

    /// Reply to the peer identified by `token`.
    async fn send_reply(&self, token: ReplyToken, reply: Message) -> Result<(), WireError>;
}
