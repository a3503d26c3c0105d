//! Topics and payloads spoken between a coordinator and its workers.
//!
//! Topics follow the pattern `schwarm.worker.<operation>`. A worker answers
//! each request with `<topic>.reply`, or with [`RUN_ERROR`] when the task
//! itself failed. [`SHUTDOWN`] is one-way and gets no answer.

use serde::{Deserialize, Serialize};

/// Liveness probe. Payload `()`, reply [`Pong`].
pub const PING: &str = "schwarm.worker.ping";
pub const PING_REPLY: &str = "schwarm.worker.ping.reply";

/// Capability negotiation. Payload `()`, reply [`Capabilities`].
pub const DESCRIBE: &str = "schwarm.worker.describe";
pub const DESCRIBE_REPLY: &str = "schwarm.worker.describe.reply";

/// Execute one task. Payload is the encoded task, reply the encoded output.
pub const RUN: &str = "schwarm.worker.run";
pub const RUN_REPLY: &str = "schwarm.worker.run.reply";
/// The task raised an error; payload [`RunFailure`].
pub const RUN_ERROR: &str = "schwarm.worker.run.error";

/// Ask the worker process to exit. Payload `()`.
pub const SHUTDOWN: &str = "schwarm.worker.shutdown";

/// Generic failure reply for unknown topics; payload [`RunFailure`].
pub const UNSUPPORTED: &str = "schwarm.worker.unsupported";

/// Answer to [`PING`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Object name the worker serves under.
    pub name: String,
}

/// Answer to [`DESCRIBE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// True when the peer accepts [`RUN`] requests.
    pub is_worker: bool,
    /// Which runner the worker hosts (e.g. "fib", "echo").
    pub kind: String,
}

/// Error text returned in place of a task output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub message: String,
}

/// Reply topic for a request topic.
pub fn reply_topic(topic: &str) -> String {
    format!("{topic}.reply")
}
