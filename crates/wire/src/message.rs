use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire-format envelope exchanged between the coordinator and its workers.
///
/// Envelopes are serialized with MessagePack. The `topic` selects the worker
/// operation (see [`crate::protocol`]) and `correlation_id` pairs each reply
/// with the request that caused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Operation topic (e.g. "schwarm.worker.run").
    pub topic: String,

    /// MessagePack-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    /// Correlation ID matching replies to requests.
    pub correlation_id: Uuid,

    /// Protocol version of the payload.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self::raw(topic, rmp_serde::to_vec(payload)?))
    }

    /// Create a message with an explicit correlation ID (for replies).
    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self::raw_reply(
            topic,
            rmp_serde::to_vec(payload)?,
            correlation_id,
        ))
    }

    /// Wrap payload bytes that are already MessagePack-encoded.
    ///
    /// Task arguments and results travel this way: the coordinator encodes
    /// them once and the envelope carries them untouched.
    pub fn raw(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::raw_reply(topic, payload, Uuid::new_v4())
    }

    /// Like [`Message::raw`], answering the request with `correlation_id`.
    pub fn raw_reply(topic: impl Into<String>, payload: Vec<u8>, correlation_id: Uuid) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id,
            version: 1,
        }
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// Serialize this entire message envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a message envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Serde helper so `Vec<u8>` is written as a MessagePack bin, not an array.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
