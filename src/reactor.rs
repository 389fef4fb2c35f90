//! Reactor: the long-running primary-topic consumer.
//!
//! The reactor pulls messages from one primary topic and, for each message,
//! asks its [`Handler`] for a dependency map, evaluates it (one rendezvous
//! per subtask), hands the results back to the handler for the final value,
//! and dispatches that value to the message's `return-topic` and/or the
//! output channel.
//!
//! # Concurrency
//!
//! The consume loop is a single task; every message is processed on its own
//! spawned task, so a slow rendezvous for one message never stalls the
//! others. Within one message, subtask dispatch is sequential. There is no
//! ordering across messages.
//!
//! # Errors
//!
//! Per-message failures are isolated: they are logged, surfaced on the
//! output channel as `Err(ProcessError)`, and recorded on the dead-letter
//! topic when one is configured. The loop itself only stops on shutdown or
//! when the broker closes.
//!
//! # Example
//!
//! ```rust,ignore
//! use reverb::reactor::{Elements, Handler, Reactor};
//!
//! struct Doubler;
//!
//! #[async_trait]
//! impl Handler for Doubler {
//!     async fn process(&self, message: &Message, _results: &ResultMap) -> Value {
//!         json!({"doubled": message.data().and_then(Value::as_i64).unwrap_or(0) * 2})
//!     }
//! }
//!
//! let elements = Elements::new(broker, "jobs").output(tx);
//! let handle = Reactor::new(Doubler).start(elements);
//! // ...
//! handle.stop().await;
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, BrokerProps};
use crate::combine::CombinatorRegistry;
use crate::dag::{evaluate, DagError, ResultMap, TaskMap};
use crate::dlq::DeadLetters;
use crate::payload::{self, CodecError, Message};
use crate::shutdown::ShutdownSignal;
use crate::DEFAULT_RENDEZVOUS_TIMEOUT;

/// User-supplied message logic.
///
/// `dependencies` maps a message to its subtask dependency map (empty by
/// default); `process` computes the final result once every subtask has
/// completed. Both see the decoded message; neither touches the broker.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The dependency map for `message`. Defaults to no dependencies.
    fn dependencies(&self, message: &Message) -> TaskMap {
        let _ = message;
        TaskMap::new()
    }

    /// Compute the final result from the message and its subtask results.
    async fn process(&self, message: &Message, results: &ResultMap) -> Value;
}

/// Errors that kill a single message (never the reactor).
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The dependency map was invalid or a subtask failed.
    #[error("dependency evaluation failed: {0}")]
    Dependencies(#[from] DagError),

    /// The final result could not be produced to the `return-topic`.
    #[error("reply to '{topic}' failed: {source}")]
    Reply {
        topic: String,
        #[source]
        source: BrokerError,
    },

    /// The final result could not be encoded.
    #[error("failed to encode result: {0}")]
    Encode(#[from] CodecError),
}

/// What the output channel carries: per-message results or failures.
pub type Output = Result<Value, ProcessError>;

/// The reactor's resource bundle: broker handle, primary topic, consumer
/// and rendezvous configuration, and the optional output channel and
/// dead-letter sink.
pub struct Elements {
    broker: Arc<dyn Broker>,
    primary_topic: String,
    consumer_props: BrokerProps,
    reply_props: BrokerProps,
    rendezvous_timeout: Duration,
    output: Option<mpsc::Sender<Output>>,
    dead_letters: Option<DeadLetters>,
}

impl Elements {
    /// Bundle a broker handle with the primary topic to consume.
    pub fn new(broker: Arc<dyn Broker>, primary_topic: impl Into<String>) -> Self {
        Self {
            broker,
            primary_topic: primary_topic.into(),
            consumer_props: BrokerProps::new(),
            reply_props: BrokerProps::new(),
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            output: None,
            dead_letters: None,
        }
    }

    /// Configuration for the primary consumer (opaque pass-through).
    pub fn consumer_props(mut self, props: BrokerProps) -> Self {
        self.consumer_props = props;
        self
    }

    /// Configuration for rendezvous reply consumers (opaque pass-through).
    pub fn reply_props(mut self, props: BrokerProps) -> Self {
        self.reply_props = props;
        self
    }

    /// Per-call rendezvous timeout.
    pub fn rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    /// Deliver results (and per-message errors) on `sender`.
    ///
    /// The channel is closed exactly once, on shutdown. A bounded channel
    /// applies backpressure to the sending message task only; the primary
    /// consume loop is unaffected.
    pub fn output(mut self, sender: mpsc::Sender<Output>) -> Self {
        self.output = Some(sender);
        self
    }

    /// Record failed messages on a dead-letter topic.
    pub fn dead_letters(mut self, topic: impl Into<String>) -> Self {
        self.dead_letters = Some(DeadLetters::new(self.broker.clone(), topic));
        self
    }
}

/// Lifecycle of a started reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    /// Created, consumer not yet bound.
    New,
    /// Consuming the primary topic.
    Running,
    /// Draining in-flight messages after a shutdown request.
    Stopping,
    /// Fully stopped; resources released.
    Stopped,
}

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

impl ReactorState {
    fn from_u8(state: u8) -> Self {
        match state {
            STATE_NEW => Self::New,
            STATE_RUNNING => Self::Running,
            STATE_STOPPING => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// A reactor, ready to be started with an [`Elements`] bundle.
pub struct Reactor {
    handler: Arc<dyn Handler>,
    combinators: Arc<CombinatorRegistry>,
}

impl Reactor {
    /// A reactor with the built-in combinators.
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            combinators: Arc::new(CombinatorRegistry::new()),
        }
    }

    /// Replace the combinator registry (for custom combinators).
    pub fn with_combinators(mut self, registry: CombinatorRegistry) -> Self {
        self.combinators = Arc::new(registry);
        self
    }

    /// Start consuming; returns the running reactor's handle.
    pub fn start(self, elements: Elements) -> ReactorHandle {
        let state = Arc::new(AtomicU8::new(STATE_NEW));
        let shutdown = ShutdownSignal::new();

        let join = tokio::spawn(run(
            self.handler,
            self.combinators,
            elements,
            shutdown.clone(),
            state.clone(),
        ));

        ReactorHandle {
            state,
            shutdown,
            join,
        }
    }
}

/// Handle to a running reactor.
pub struct ReactorHandle {
    state: Arc<AtomicU8>,
    shutdown: ShutdownSignal,
    join: JoinHandle<()>,
}

impl ReactorHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ReactorState {
        ReactorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Request shutdown without waiting for it.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for the reactor to stop.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(error = %e, "reactor task panicked");
        }
    }

    /// Request shutdown and wait for it to complete.
    pub async fn stop(self) {
        self.shutdown();
        self.join().await;
    }
}

/// Shared context for per-message tasks.
struct Worker {
    handler: Arc<dyn Handler>,
    combinators: Arc<CombinatorRegistry>,
    broker: Arc<dyn Broker>,
    reply_props: BrokerProps,
    rendezvous_timeout: Duration,
    output: Option<mpsc::Sender<Output>>,
    dead_letters: Option<DeadLetters>,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Worker {
    async fn process(self: Arc<Self>, message: Message) {
        match self.handle(&message).await {
            Ok(value) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    topic = %message.topic,
                    offset = message.offset,
                    "message processed"
                );
                if let Some(tx) = &self.output {
                    if tx.send(Ok(value)).await.is_err() {
                        debug!("output receiver dropped; discarding result");
                    }
                }
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "message processing failed"
                );
                if let Some(dlq) = &self.dead_letters {
                    dlq.record(&message, &e).await;
                }
                if let Some(tx) = &self.output {
                    let _ = tx.send(Err(e)).await;
                }
            }
        }
    }

    async fn handle(&self, message: &Message) -> Result<Value, ProcessError> {
        let tasks = self.handler.dependencies(message);
        let results = evaluate(
            &tasks,
            self.broker.as_ref(),
            &self.combinators,
            &self.reply_props,
            self.rendezvous_timeout,
        )
        .await?;

        let value = self.handler.process(message, &results).await;

        // The reply is produced before the channel send, never after it.
        if let Some(return_topic) = message.return_topic() {
            let bytes = payload::encode(&value)?;
            self.broker
                .produce(return_topic, Some(&message.topic), &bytes)
                .await
                .map_err(|source| ProcessError::Reply {
                    topic: return_topic.to_string(),
                    source,
                })?;
            debug!(return_topic = %return_topic, "reply produced");
        }

        Ok(value)
    }
}

async fn run(
    handler: Arc<dyn Handler>,
    combinators: Arc<CombinatorRegistry>,
    elements: Elements,
    shutdown: ShutdownSignal,
    state: Arc<AtomicU8>,
) {
    let Elements {
        broker,
        primary_topic,
        consumer_props,
        reply_props,
        rendezvous_timeout,
        output,
        dead_letters,
    } = elements;

    let mut signal = shutdown.subscribe();
    let mut stream = match broker.subscribe(&consumer_props, &primary_topic).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(topic = %primary_topic, error = %e, "failed to bind primary consumer");
            state.store(STATE_STOPPED, Ordering::Release);
            return;
        }
    };

    state.store(STATE_RUNNING, Ordering::Release);
    info!(topic = %primary_topic, "reactor consuming");

    let worker = Arc::new(Worker {
        handler,
        combinators,
        broker: broker.clone(),
        reply_props,
        rendezvous_timeout,
        output,
        dead_letters,
        processed: AtomicU64::new(0),
        failed: AtomicU64::new(0),
    });
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = signal.recv() => {
                info!("shutdown signal received");
                break;
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            next = stream.next() => match next {
                None => {
                    info!("primary stream ended");
                    break;
                }
                Some(Err(BrokerError::Closed)) => {
                    info!("broker closed; stopping");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "primary consumer error");
                }
                Some(Ok(record)) => {
                    let message = match Message::from_record(record) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "skipping malformed payload");
                            continue;
                        }
                    };
                    debug!(
                        topic = %message.topic,
                        offset = message.offset,
                        "dispatching message"
                    );
                    tasks.spawn(worker.clone().process(message));
                }
            }
        }
    }

    state.store(STATE_STOPPING, Ordering::Release);

    // Stop intake first, then close the broker so in-flight rendezvous
    // fail fast instead of waiting out their timeouts.
    drop(stream);
    broker.close().await;
    while tasks.join_next().await.is_some() {}

    let processed = worker.processed.load(Ordering::Relaxed);
    let failed = worker.failed.load(Ordering::Relaxed);
    // Last owner of the output sender; dropping it closes the channel.
    drop(worker);

    info!(processed, failed, "reactor stopped");
    state.store(STATE_STOPPED, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageStream;
    use crate::dag::TaskSpec;
    use crate::memory::MemoryBroker;
    use crate::payload::Request;
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    const TICK: Duration = Duration::from_millis(10);

    /// Serves every request arriving on `topic` by applying `f` to its args.
    fn serve(
        broker: Arc<MemoryBroker>,
        topic: &str,
        f: impl Fn(Vec<Value>) -> Value + Send + 'static,
    ) {
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut stream = broker
                .subscribe(&BrokerProps::new(), &topic)
                .await
                .unwrap();
            while let Some(Ok(record)) = stream.next().await {
                let request = Request::from_bytes(&record.payload).unwrap();
                let reply = payload::encode(&f(request.data)).unwrap();
                broker
                    .produce(&request.response_topic, None, &reply)
                    .await
                    .unwrap();
            }
        });
    }

    async fn send(broker: &MemoryBroker, topic: &str, value: Value) {
        broker
            .produce(topic, None, &payload::encode(&value).unwrap())
            .await
            .unwrap();
    }

    /// Wraps the message's `data` field as `{"ok": <data>}`.
    struct Wrap;

    #[async_trait]
    impl Handler for Wrap {
        async fn process(&self, message: &Message, _results: &ResultMap) -> Value {
            json!({"ok": message.data().cloned().unwrap_or(Value::Null)})
        }
    }

    #[tokio::test]
    async fn result_reaches_return_topic_and_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Reactor::new(Wrap).start(
            Elements::new(broker.clone(), "primary").output(tx),
        );

        send(&broker, "primary", json!({"return-topic": "out", "data": 7})).await;

        let value = rx.recv().await.unwrap().unwrap();
        assert_eq!(value, json!({"ok": 7}));

        let mut replies = broker.subscribe(&BrokerProps::new(), "out").await.unwrap();
        let record = replies.next().await.unwrap().unwrap();
        assert_eq!(record.key.as_deref(), Some("primary"));
        assert_eq!(payload::decode(&record.payload).unwrap(), json!({"ok": 7}));

        handle.stop().await;
    }

    /// One dependency on the `add` subtask; the final result wraps its sum.
    struct SumHandler;

    #[async_trait]
    impl Handler for SumHandler {
        fn dependencies(&self, _message: &Message) -> TaskMap {
            let mut tasks = TaskMap::new();
            tasks.insert(
                "a".to_string(),
                TaskSpec::new("add", vec![json!(1), json!(2), json!(3)]),
            );
            tasks
        }

        async fn process(&self, _message: &Message, results: &ResultMap) -> Value {
            json!({"sum": results["a"].result})
        }
    }

    #[tokio::test]
    async fn dependencies_resolve_before_process() {
        let broker = Arc::new(MemoryBroker::new());
        serve(broker.clone(), "add", |args| {
            json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
        });

        let (tx, mut rx) = mpsc::channel(8);
        let handle = Reactor::new(SumHandler).start(
            Elements::new(broker.clone(), "primary").output(tx),
        );

        send(&broker, "primary", json!({"data": null})).await;

        let value = rx.recv().await.unwrap().unwrap();
        assert_eq!(value, json!({"sum": 6}));

        handle.stop().await;
    }

    /// Declares a two-node cycle; `process` is never reached.
    struct Cyclic;

    #[async_trait]
    impl Handler for Cyclic {
        fn dependencies(&self, _message: &Message) -> TaskMap {
            let mut tasks = TaskMap::new();
            tasks.insert("a".to_string(), TaskSpec::new("x", vec![]).after(["b"]));
            tasks.insert("b".to_string(), TaskSpec::new("y", vec![]).after(["a"]));
            tasks
        }

        async fn process(&self, _message: &Message, _results: &ResultMap) -> Value {
            Value::Null
        }
    }

    #[tokio::test]
    async fn cycle_surfaces_on_channel_and_does_not_stop_reactor() {
        let broker = Arc::new(MemoryBroker::new());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Reactor::new(Cyclic).start(
            Elements::new(broker.clone(), "primary")
                .output(tx)
                .dead_letters("dead-letters"),
        );

        send(&broker, "primary", json!({"data": 1})).await;

        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Dependencies(DagError::Cycle(_))
        ));

        // The failure was dead-lettered and the loop is still consuming.
        let mut dlq = broker
            .subscribe(&BrokerProps::new(), "dead-letters")
            .await
            .unwrap();
        let entry = dlq.next().await.unwrap().unwrap();
        assert_eq!(entry.key.as_deref(), Some("primary"));

        send(&broker, "primary", json!({"data": 2})).await;
        assert!(rx.recv().await.unwrap().is_err());

        handle.stop().await;
    }

    /// Signals on a side channel whenever `process` runs.
    struct Notify(mpsc::UnboundedSender<()>);

    #[async_trait]
    impl Handler for Notify {
        async fn process(&self, _message: &Message, _results: &ResultMap) -> Value {
            let _ = self.0.send(());
            json!("done")
        }
    }

    #[tokio::test]
    async fn without_return_topic_or_channel_result_is_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let (tx, mut processed) = mpsc::unbounded_channel();
        let handle =
            Reactor::new(Notify(tx)).start(Elements::new(broker.clone(), "primary"));

        send(&broker, "primary", json!({"data": 1})).await;
        processed.recv().await.unwrap();
        send(&broker, "primary", json!({"data": 2})).await;
        processed.recv().await.unwrap();

        // Both messages were consumed; nothing beyond them was produced.
        assert_eq!(broker.produce_count(), 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        broker.produce("primary", None, b"{oops").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = Reactor::new(Wrap).start(
            Elements::new(broker.clone(), "primary").output(tx),
        );

        send(&broker, "primary", json!({"data": 9})).await;

        // Only the well-formed message produces output.
        let value = rx.recv().await.unwrap().unwrap();
        assert_eq!(value, json!({"ok": 9}));

        handle.stop().await;
    }

    /// Routes each message to the subtask named by its `data` field.
    struct Route;

    #[async_trait]
    impl Handler for Route {
        fn dependencies(&self, message: &Message) -> TaskMap {
            let topic = message.data().and_then(Value::as_str).unwrap_or("fast");
            let mut tasks = TaskMap::new();
            tasks.insert("r".to_string(), TaskSpec::new(topic, vec![]));
            tasks
        }

        async fn process(&self, _message: &Message, results: &ResultMap) -> Value {
            results["r"].result.clone()
        }
    }

    #[tokio::test]
    async fn slow_message_does_not_stall_fast_one() {
        let broker = Arc::new(MemoryBroker::new());
        serve(broker.clone(), "fast", |_| json!("fast"));
        {
            let broker = broker.clone();
            tokio::spawn(async move {
                let mut stream = broker
                    .subscribe(&BrokerProps::new(), "slow")
                    .await
                    .unwrap();
                while let Some(Ok(record)) = stream.next().await {
                    let request = Request::from_bytes(&record.payload).unwrap();
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        sleep(Duration::from_millis(300)).await;
                        broker
                            .produce(
                                &request.response_topic,
                                None,
                                &payload::encode(&json!("slow")).unwrap(),
                            )
                            .await
                            .unwrap();
                    });
                }
            });
        }

        let (tx, mut rx) = mpsc::channel(8);
        let handle = Reactor::new(Route).start(
            Elements::new(broker.clone(), "primary").output(tx),
        );

        send(&broker, "primary", json!({"data": "slow"})).await;
        send(&broker, "primary", json!({"data": "fast"})).await;

        // The fast message finishes first despite arriving second.
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, json!("fast"));
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second, json!("slow"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn shutdown_closes_channel_and_stops_loop() {
        let broker = Arc::new(MemoryBroker::new());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Reactor::new(Wrap).start(
            Elements::new(broker.clone(), "primary").output(tx),
        );

        while handle.state() != ReactorState::Running {
            sleep(TICK).await;
        }

        handle.shutdown();
        handle.join().await;

        // The channel is closed and nothing else arrives.
        assert!(timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn state_machine_runs_to_stopped() {
        let broker = Arc::new(MemoryBroker::new());
        let reactor = Reactor::new(Wrap);
        let handle = reactor.start(Elements::new(broker.clone(), "primary"));

        while handle.state() != ReactorState::Running {
            sleep(TICK).await;
        }

        handle.shutdown();
        let state = handle.state.clone();
        handle.join().await;
        assert_eq!(
            ReactorState::from_u8(state.load(Ordering::Acquire)),
            ReactorState::Stopped
        );
    }
}
