//! Dead-letter topic for messages that fail processing.
//!
//! A message whose evaluation or reply dispatch fails is recorded on a
//! dead-letter topic for later inspection, together with its coordinates
//! and the error that killed it. Recording is fire-and-forget: a failure to
//! dead-letter is logged and never escalated, so the reactor's per-message
//! isolation holds even when the dead-letter topic is unavailable.

use std::fmt::Display;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::payload::{self, Message};

/// Writes failed messages to a dead-letter topic.
#[derive(Clone)]
pub struct DeadLetters {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl DeadLetters {
    /// Dead-letter sink producing to `topic` through the shared broker.
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    /// The dead-letter topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Record a failed message.
    ///
    /// The record carries the message's coordinates and value, the error
    /// text, and an RFC 3339 failure timestamp, keyed by the originating
    /// topic.
    pub async fn record(&self, message: &Message, error: impl Display) {
        let error = error.to_string();
        let entry = json!({
            "topic": message.topic,
            "partition": message.partition,
            "offset": message.offset,
            "value": message.value,
            "error": error,
            "failed-at": chrono::Utc::now().to_rfc3339(),
        });

        let bytes = match payload::encode(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode dead-letter record");
                return;
            }
        };

        match self
            .broker
            .produce(&self.topic, Some(&message.topic), &bytes)
            .await
        {
            Ok(ack) => info!(
                dlq_topic = %self.topic,
                source_topic = %message.topic,
                offset = ack.offset,
                error = %error,
                "message dead-lettered"
            ),
            Err(e) => warn!(
                dlq_topic = %self.topic,
                source_topic = %message.topic,
                error = %e,
                "failed to dead-letter message"
            ),
        }
    }
}
