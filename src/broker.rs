//! Broker adapter: the capability surface over the message broker.
//!
//! The [`Broker`] trait is the thin seam between the orchestration logic and
//! the broker client. It covers exactly what the rest of the system needs:
//! acknowledged produces, topic subscription as a lazy record stream, and
//! idempotent topic administration. [`KafkaBroker`] implements it over
//! rdkafka; [`crate::memory::MemoryBroker`] implements it in-process.
//!
//! Consumer and producer configuration maps are passed through to the
//! client untouched; the adapter does not reinterpret keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, warn};

use crate::payload::Record;

/// Opaque broker configuration: key/value pairs handed to the client as-is.
pub type BrokerProps = HashMap<String, String>;

/// How long topic administration may wait for the cluster to apply and
/// propagate an operation.
const ADMIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `close` waits for in-flight produces to drain.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker acknowledgment of a successful produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Partition the record landed on.
    pub partition: i32,

    /// Offset assigned to the record.
    pub offset: i64,
}

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker rejected or timed out a produce.
    #[error("produce to '{topic}' failed: {reason}")]
    Produce { topic: String, reason: String },

    /// A consumer could not be created or bound to its topic.
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// A consumer failed while reading.
    #[error("consume from '{topic}' failed: {reason}")]
    Consume { topic: String, reason: String },

    /// Topic creation or deletion failed.
    #[error("topic administration for '{topic}' failed: {reason}")]
    Admin { topic: String, reason: String },

    /// The handle has been closed; no further operations are permitted.
    #[error("broker is closed")]
    Closed,
}

/// A lazy, potentially infinite stream of records from one topic.
#[async_trait]
pub trait MessageStream: Send {
    /// The next record in broker-delivery order.
    ///
    /// Returns `None` once the stream has terminated (topic deleted or
    /// broker closed). Errors are yielded in-band so a transient consumer
    /// failure does not end the stream.
    async fn next(&mut self) -> Option<Result<Record, BrokerError>>;
}

/// Capability surface over the message broker.
///
/// Implementations must support concurrent `produce` calls with independent
/// acknowledgments; one handle is shared by every in-flight message task.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Produce a record and wait for the broker's acknowledgment.
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<Ack, BrokerError>;

    /// Bind a fresh consumer to `topic` and return its record stream.
    async fn subscribe(
        &self,
        props: &BrokerProps,
        topic: &str,
    ) -> Result<Box<dyn MessageStream>, BrokerError>;

    /// Create `topic` with a single partition.
    ///
    /// Idempotent: succeeds if the topic already exists. Must not return
    /// before the topic is visible to subsequent `subscribe` calls, so a
    /// reply produced right after creation cannot be lost.
    async fn create_topic(&self, name: &str) -> Result<(), BrokerError>;

    /// Delete `topic`. Idempotent: succeeds if the topic does not exist.
    async fn delete_topic(&self, name: &str) -> Result<(), BrokerError>;

    /// Whether `topic` currently exists.
    async fn topic_exists(&self, name: &str) -> Result<bool, BrokerError>;

    /// Release broker-side resources.
    ///
    /// Flushes pending produces. After this returns, every other operation
    /// fails with [`BrokerError::Closed`].
    async fn close(&self);
}

/// Fill in a `group.id` when the caller's config does not carry one.
///
/// Kafka requires a group id before `subscribe`; ephemeral reply consumers
/// are bound to a topic that exists for exactly one exchange, so the topic
/// name itself is a safe single-member group.
fn effective_group_id<'a>(props: &'a BrokerProps, topic: &'a str) -> &'a str {
    props.get("group.id").map_or(topic, String::as_str)
}

fn client_config(props: &BrokerProps) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in props {
        config.set(key, value);
    }
    config
}

/// [`Broker`] implementation over an Apache Kafka cluster.
///
/// Holds one shared [`FutureProducer`] (safe for concurrent use) and one
/// [`AdminClient`] through which all topic administration flows. Consumers
/// are created per `subscribe` call and dropped with their stream.
pub struct KafkaBroker {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    brokers: String,
    replication: i32,
    closed: AtomicBool,
}

impl KafkaBroker {
    /// Connect to a cluster.
    ///
    /// `brokers` is the bootstrap list; it also bootstraps the admin client.
    /// `producer_props` are passed through to the producer untouched.
    /// `replication` is the replication factor for created topics.
    pub fn new(
        brokers: &str,
        producer_props: &BrokerProps,
        replication: i32,
    ) -> Result<Self, BrokerError> {
        let mut producer_config = client_config(producer_props);
        producer_config.set("bootstrap.servers", brokers);
        let producer: FutureProducer =
            producer_config.create().map_err(|e| BrokerError::Produce {
                topic: "*".to_string(),
                reason: format!("failed to create producer: {e}"),
            })?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .create()
            .map_err(|e| BrokerError::Admin {
                topic: "*".to_string(),
                reason: format!("failed to create admin client: {e}"),
            })?;

        Ok(Self {
            producer,
            admin,
            brokers: brokers.to_string(),
            replication,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn admin_options() -> AdminOptions {
        AdminOptions::new().operation_timeout(Some(ADMIN_OPERATION_TIMEOUT))
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<Ack, BrokerError> {
        self.ensure_open()?;

        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok((partition, offset)) => {
                debug!(topic = %topic, partition, offset, "produce acknowledged");
                Ok(Ack { partition, offset })
            }
            Err((e, _)) => Err(BrokerError::Produce {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        props: &BrokerProps,
        topic: &str,
    ) -> Result<Box<dyn MessageStream>, BrokerError> {
        self.ensure_open()?;

        let mut config = client_config(props);
        config.set("bootstrap.servers", &self.brokers);
        config.set("group.id", effective_group_id(props, topic));
        // A reply produced between dispatch and this bind must still be
        // seen, so a fresh group starts from the beginning of the topic.
        if !props.contains_key("auto.offset.reset") {
            config.set("auto.offset.reset", "earliest");
        }

        let consumer: StreamConsumer = config.create().map_err(|e| BrokerError::Subscribe {
            topic: topic.to_string(),
            reason: format!("failed to create consumer: {e}"),
        })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        debug!(topic = %topic, "consumer bound");
        Ok(Box::new(KafkaStream {
            consumer,
            topic: topic.to_string(),
        }))
    }

    async fn create_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let topic = NewTopic::new(name, 1, TopicReplication::Fixed(self.replication));
        let results = self
            .admin
            .create_topics([&topic], &Self::admin_options())
            .await
            .map_err(|e| BrokerError::Admin {
                topic: name.to_string(),
                reason: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(_) => debug!(topic = %name, "topic created"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "topic already exists");
                }
                Err((topic, code)) => {
                    return Err(BrokerError::Admin {
                        topic,
                        reason: code.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let results = self
            .admin
            .delete_topics(&[name], &Self::admin_options())
            .await
            .map_err(|e| BrokerError::Admin {
                topic: name.to_string(),
                reason: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(_) => debug!(topic = %name, "topic deleted"),
                Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                    debug!(topic = %name, "topic already absent");
                }
                Err((topic, code)) => {
                    return Err(BrokerError::Admin {
                        topic,
                        reason: code.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn topic_exists(&self, name: &str) -> Result<bool, BrokerError> {
        self.ensure_open()?;

        let metadata = self
            .producer
            .client()
            .fetch_metadata(Some(name), ADMIN_OPERATION_TIMEOUT)
            .map_err(|e| BrokerError::Admin {
                topic: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(metadata
            .topics()
            .iter()
            .any(|t| t.name() == name && t.error().is_none() && !t.partitions().is_empty()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.producer.flush(CLOSE_FLUSH_TIMEOUT) {
            warn!(error = %e, "failed to flush producer on close");
        }
        debug!("kafka broker closed");
    }
}

struct KafkaStream {
    consumer: StreamConsumer,
    topic: String,
}

#[async_trait]
impl MessageStream for KafkaStream {
    async fn next(&mut self) -> Option<Result<Record, BrokerError>> {
        match self.consumer.recv().await {
            Ok(msg) => Some(Ok(Record {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Err(e) => Some(Err(BrokerError::Consume {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })),
        }
    }
}
