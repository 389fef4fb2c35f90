//! Ephemeral request/reply rendezvous.
//!
//! The broker is fire-and-forget; a request/response call is synthesized by
//! creating a uniquely named reply topic, sending the request with that
//! topic as its return address, consuming exactly one reply, and tearing the
//! topic down.
//!
//! The reply topic is created before the request is produced and is visible
//! to consumers by the time `create_topic` returns, so a service that
//! replies immediately cannot race the reply consumer.
//!
//! On every successful return the reply topic has been deleted. Failure
//! paths delete it best-effort; residue from a crash is left to broker-side
//! cleanup.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, BrokerProps};
use crate::payload::{self, CodecError, Request};

/// Errors from a rendezvous exchange.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// The reply topic or its consumer could not be set up.
    #[error("rendezvous setup failed: {0}")]
    Setup(#[source] BrokerError),

    /// The request could not be produced to the subtask topic.
    #[error("rendezvous dispatch to '{topic}' failed: {source}")]
    Dispatch {
        topic: String,
        #[source]
        source: BrokerError,
    },

    /// No reply arrived within the configured window.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The reply stream ended before a reply arrived.
    #[error("reply stream ended before a reply arrived")]
    Interrupted,

    /// The request could not be encoded or the reply could not be decoded.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
}

/// Perform one request/reply exchange against `topic`.
///
/// Creates a fresh UUID-named reply topic, produces
/// `{"response-topic": <uuid>, "data": args}` keyed by `topic`, waits for
/// exactly one reply under `timeout`, deletes the reply topic, and returns
/// the decoded reply value. `reply_props` configures the short-lived reply
/// consumer and is passed through to the broker untouched.
pub async fn rendezvous(
    broker: &dyn Broker,
    topic: &str,
    args: Vec<Value>,
    reply_props: &BrokerProps,
    timeout: Duration,
) -> Result<Value, RendezvousError> {
    let reply_topic = Uuid::new_v4().to_string();

    broker
        .create_topic(&reply_topic)
        .await
        .map_err(RendezvousError::Setup)?;
    debug!(reply_topic = %reply_topic, subtask = %topic, "reply topic created");

    let request = Request {
        response_topic: reply_topic.clone(),
        data: args,
    };
    let bytes = request.to_bytes()?;

    if let Err(e) = broker.produce(topic, Some(topic), &bytes).await {
        discard(broker, &reply_topic).await;
        return Err(RendezvousError::Dispatch {
            topic: topic.to_string(),
            source: e,
        });
    }

    let mut replies = match broker.subscribe(reply_props, &reply_topic).await {
        Ok(stream) => stream,
        Err(e) => {
            discard(broker, &reply_topic).await;
            return Err(RendezvousError::Setup(e));
        }
    };

    let reply = match tokio::time::timeout(timeout, replies.next()).await {
        Ok(Some(Ok(record))) => record,
        Ok(Some(Err(e))) => {
            drop(replies);
            discard(broker, &reply_topic).await;
            return Err(RendezvousError::Setup(e));
        }
        Ok(None) => {
            drop(replies);
            discard(broker, &reply_topic).await;
            return Err(RendezvousError::Interrupted);
        }
        Err(_) => {
            drop(replies);
            discard(broker, &reply_topic).await;
            return Err(RendezvousError::Timeout(timeout));
        }
    };

    drop(replies);
    discard(broker, &reply_topic).await;

    let value = payload::decode(&reply.payload)?;
    debug!(reply_topic = %reply_topic, subtask = %topic, "reply received");
    Ok(value)
}

/// Best-effort deletion of a reply topic.
async fn discard(broker: &dyn Broker, reply_topic: &str) {
    if let Err(e) = broker.delete_topic(reply_topic).await {
        warn!(reply_topic = %reply_topic, error = %e, "failed to delete reply topic");
    }
}
