//! In-process broker for tests and local development.
//!
//! [`MemoryBroker`] keeps every topic as an in-memory log with live
//! fan-out to subscribers. Subscriptions replay the existing log before
//! delivering new records, so a reply produced before its consumer binds is
//! not lost — the same visibility guarantee the real adapter gets from
//! topic-creation propagation.
//!
//! Counters for produces and topic creations are exposed so tests can assert
//! that failure paths generate no broker traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broker::{Ack, Broker, BrokerError, BrokerProps, MessageStream};
use crate::payload::Record;

#[derive(Default)]
struct TopicState {
    log: Vec<(Option<String>, Vec<u8>)>,
    subscribers: Vec<mpsc::UnboundedSender<Record>>,
}

/// An in-memory [`Broker`] over a shared topic table.
///
/// Topics are auto-created on first produce or subscribe, mirroring a
/// development cluster; [`MemoryBroker::create_count`] still counts only
/// explicit `create_topic` calls.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicState>>,
    closed: AtomicBool,
    produces: AtomicU64,
    creates: AtomicU64,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of acknowledged produces since construction.
    pub fn produce_count(&self) -> u64 {
        self.produces.load(Ordering::Relaxed)
    }

    /// Number of explicit `create_topic` calls since construction.
    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    /// Names of all live topics.
    pub fn topic_names(&self) -> Vec<String> {
        let topics = self.topics.lock();
        topics.keys().cloned().collect()
    }

    /// Total records ever appended to `topic` (0 if it does not exist).
    pub fn log_len(&self, topic: &str) -> usize {
        let topics = self.topics.lock();
        topics.get(topic).map_or(0, |t| t.log.len())
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<Ack, BrokerError> {
        self.ensure_open()?;

        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        let offset = state.log.len() as i64;
        state.log.push((key.map(str::to_string), payload.to_vec()));

        let record = Record {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: key.map(str::to_string),
            payload: payload.to_vec(),
        };
        state.subscribers.retain(|tx| tx.send(record.clone()).is_ok());

        self.produces.fetch_add(1, Ordering::Relaxed);
        Ok(Ack {
            partition: 0,
            offset,
        })
    }

    async fn subscribe(
        &self,
        _props: &BrokerProps,
        topic: &str,
    ) -> Result<Box<dyn MessageStream>, BrokerError> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();

        // Replay the log so records produced before this bind are seen.
        for (offset, (key, payload)) in state.log.iter().enumerate() {
            let _ = tx.send(Record {
                topic: topic.to_string(),
                partition: 0,
                offset: offset as i64,
                key: key.clone(),
                payload: payload.clone(),
            });
        }
        state.subscribers.push(tx);

        Ok(Box::new(MemoryStream { rx }))
    }

    async fn create_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut topics = self.topics.lock();
        topics.entry(name.to_string()).or_default();
        self.creates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut topics = self.topics.lock();
        // Dropping the state drops the senders, ending subscriber streams.
        topics.remove(name);
        Ok(())
    }

    async fn topic_exists(&self, name: &str) -> Result<bool, BrokerError> {
        self.ensure_open()?;

        let topics = self.topics.lock();
        Ok(topics.contains_key(name))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut topics = self.topics.lock();
        topics.clear();
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Record>,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Record, BrokerError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produce_assigns_sequential_offsets() {
        let broker = MemoryBroker::new();
        let a = broker.produce("t", None, b"1").await.unwrap();
        let b = broker.produce("t", Some("k"), b"2").await.unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 1);
        assert_eq!(broker.produce_count(), 2);
    }

    #[tokio::test]
    async fn subscribe_replays_then_follows() {
        let broker = MemoryBroker::new();
        broker.produce("t", None, b"early").await.unwrap();

        let mut stream = broker.subscribe(&BrokerProps::new(), "t").await.unwrap();
        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!(replayed.payload, b"early");

        broker.produce("t", Some("k"), b"live").await.unwrap();
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.payload, b"live");
        assert_eq!(live.key.as_deref(), Some("k"));
        assert_eq!(live.offset, 1);
    }

    #[tokio::test]
    async fn delete_topic_ends_streams() {
        let broker = MemoryBroker::new();
        broker.create_topic("t").await.unwrap();
        let mut stream = broker.subscribe(&BrokerProps::new(), "t").await.unwrap();

        broker.delete_topic("t").await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(!broker.topic_exists("t").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.delete_topic("missing").await.unwrap();
    }

    #[tokio::test]
    async fn closed_broker_rejects_operations() {
        let broker = MemoryBroker::new();
        broker.close().await;

        let err = broker.produce("t", None, b"x").await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
        let err = broker.create_topic("t").await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
    }
}
