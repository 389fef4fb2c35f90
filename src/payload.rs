//! Payload codec and message types.
//!
//! Everything on the wire is a JSON document. A [`Record`] is the raw broker
//! record (bytes plus coordinates); a [`Message`] is the same record with its
//! payload decoded into a [`Value`]. The envelope fields recognized across
//! the system live here as constants so producers and consumers agree on
//! spelling.
//!
//! # Example
//!
//! ```json
//! {
//!   "return-topic": "orders:replies",
//!   "data": [42, "eur"]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope field naming the topic a final reply must be delivered to.
pub const RETURN_TOPIC: &str = "return-topic";

/// Envelope field carrying the per-call ephemeral reply topic.
pub const RESPONSE_TOPIC: &str = "response-topic";

/// Envelope field carrying the argument list of a subtask request.
pub const DATA: &str = "data";

/// Envelope field under which a payload may script its own dependency map.
pub const DEPS: &str = "deps";

/// Errors from payload encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload bytes were not a valid JSON document.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a value into its wire form.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

/// Parse wire bytes back into a value.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A raw broker record, before its payload is decoded.
#[derive(Debug, Clone)]
pub struct Record {
    /// Topic the record was read from (or is bound for).
    pub topic: String,

    /// Partition within the topic.
    pub partition: i32,

    /// Offset within the partition.
    pub offset: i64,

    /// Optional record key.
    pub key: Option<String>,

    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// A decoded broker record.
///
/// The `value` is arbitrary JSON; the accessors below read the well-known
/// envelope fields when the value is a mapping that carries them.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the record was read from.
    pub topic: String,

    /// Partition within the topic.
    pub partition: i32,

    /// Offset within the partition.
    pub offset: i64,

    /// Optional record key.
    pub key: Option<String>,

    /// Decoded payload.
    pub value: Value,
}

impl Message {
    /// Decode a raw record's payload.
    pub fn from_record(record: Record) -> Result<Self, CodecError> {
        let value = decode(&record.payload)?;
        Ok(Self {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            value,
        })
    }

    /// The topic a reply to this message must be delivered to, if any.
    pub fn return_topic(&self) -> Option<&str> {
        self.value.get(RETURN_TOPIC).and_then(Value::as_str)
    }

    /// The `data` field of the envelope, if present.
    pub fn data(&self) -> Option<&Value> {
        self.value.get(DATA)
    }
}

/// The request envelope produced for each subtask invocation.
///
/// The `response-topic` is the freshly created ephemeral topic the invoked
/// service must reply on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Ephemeral reply topic injected as the return address.
    #[serde(rename = "response-topic")]
    pub response_topic: String,

    /// Argument list for the subtask.
    pub data: Vec<Value>,
}

impl Request {
    /// Encode this request into its wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a request from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
