//! Producer-side pipeline.
//!
//! A [`Pipeline`] is the emitting half of the system: it publishes messages
//! to topics and, when asked to wait and a reply consumer configuration is
//! present, runs the same ephemeral rendezvous the reactor uses for its
//! subtasks. It carries no orchestration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::broker::{Ack, Broker, BrokerError, BrokerProps};
use crate::payload::{self, CodecError};
use crate::rendezvous::{rendezvous, RendezvousError};
use crate::DEFAULT_RENDEZVOUS_TIMEOUT;

/// Errors from pipeline sends.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Plain produce could not be encoded or dispatched.
    #[error("send failed: {0}")]
    Send(#[from] BrokerError),

    /// The waited-for exchange failed.
    #[error("rendezvous failed: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// The message could not be encoded.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
}

/// Outcome of a [`Pipeline::send`].
#[derive(Debug)]
pub enum Delivery {
    /// Plain produce; the handle resolves once the broker acknowledges.
    Pending(JoinHandle<Result<Ack, BrokerError>>),

    /// The exchange completed and this is the decoded reply.
    Reply(Value),

    /// The exchange completed and its reply went to the output channel.
    Channeled,
}

/// Publishes messages, optionally waiting for a reply.
pub struct Pipeline {
    broker: Arc<dyn Broker>,
    reply_props: Option<BrokerProps>,
    rendezvous_timeout: Duration,
    output: Option<mpsc::Sender<Value>>,
}

impl Pipeline {
    /// A pipeline publishing through `broker`.
    ///
    /// Without further configuration every send is a plain produce.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            reply_props: None,
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            output: None,
        }
    }

    /// Enable waited sends by configuring the reply consumer.
    pub fn reply_props(mut self, props: BrokerProps) -> Self {
        self.reply_props = Some(props);
        self
    }

    /// Per-call rendezvous timeout for waited sends.
    pub fn rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    /// Deliver replies of waited sends on `sender` instead of returning them.
    pub fn output(mut self, sender: mpsc::Sender<Value>) -> Self {
        self.output = Some(sender);
        self
    }

    /// Publish `message` to `topic`.
    ///
    /// With `wait` and a configured reply consumer, the message becomes the
    /// single argument of a rendezvous request and the reply is returned (or
    /// channel-delivered). Otherwise this is a plain produce whose pending
    /// acknowledgment is handed back.
    pub async fn send(
        &self,
        topic: &str,
        message: &Value,
        wait: bool,
    ) -> Result<Delivery, PipelineError> {
        if wait {
            if let Some(reply_props) = &self.reply_props {
                let reply = rendezvous(
                    self.broker.as_ref(),
                    topic,
                    vec![message.clone()],
                    reply_props,
                    self.rendezvous_timeout,
                )
                .await?;

                if let Some(tx) = &self.output {
                    if tx.send(reply.clone()).await.is_ok() {
                        return Ok(Delivery::Channeled);
                    }
                    debug!("output receiver dropped; returning reply directly");
                }
                return Ok(Delivery::Reply(reply));
            }
            debug!(topic = %topic, "wait requested without reply config; plain send");
        }

        let bytes = payload::encode(message)?;
        let broker = self.broker.clone();
        let topic = topic.to_string();
        Ok(Delivery::Pending(tokio::spawn(async move {
            broker.produce(&topic, None, &bytes).await
        })))
    }
}
