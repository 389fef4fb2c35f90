//! # Reverb
//!
//! A request/response overlay for fire-and-forget pub/sub brokers.
//!
//! The broker only knows topics, produce, and consume. Reverb synthesizes
//! remote calls on top of that: every outbound subtask gets a uniquely named
//! ephemeral reply topic injected into its payload as a return address, and
//! exactly one reply is consumed from that topic before it is destroyed.
//!
//! The core is the *reactor*: for each message consumed from a primary
//! topic, it evaluates a dependency graph of subtasks in topological order,
//! threading each subtask's result into its dependents' argument lists, then
//! computes a final result and dispatches it to the message's reply topic
//! and/or an output channel.
//!
//! ## Architecture
//!
//! ```text
//! primary topic ─▶ Reactor ─▶ deps ─▶ DAG evaluator ─▶ N × rendezvous ─▶ broker
//!                    │                                  (ephemeral topics)
//!                    └─▶ process ─▶ return-topic ∥ output channel
//! ```
//!
//! ## Modules
//!
//! - [`payload`]: JSON codec, envelope fields, decoded messages
//! - [`broker`]: the broker capability trait and its Kafka implementation
//! - [`memory`]: in-process broker for tests and local development
//! - [`rendezvous`]: the ephemeral request/reply exchange
//! - [`combine`]: argument combinators and their registry
//! - [`dag`]: dependency-map validation and evaluation
//! - [`reactor`]: the primary-topic consume loop
//! - [`pipeline`]: producer-side sending, optionally waiting for a reply
//! - [`dlq`]: dead-letter topic for failed messages
//! - [`config`]: TOML configuration
//! - [`shutdown`]: signal-driven graceful shutdown

pub mod broker;
pub mod combine;
pub mod config;
pub mod dag;
pub mod dlq;
pub mod memory;
pub mod payload;
pub mod pipeline;
pub mod reactor;
pub mod rendezvous;
pub mod shutdown;

// Re-export the types most callers touch.
pub use broker::{Ack, Broker, BrokerError, BrokerProps, KafkaBroker, MessageStream};
pub use combine::{Combinator, CombinatorRegistry};
pub use dag::{CompletedTask, DagError, ResultMap, TaskMap, TaskSpec};
pub use payload::{CodecError, Message, Record, Request};
pub use reactor::{Elements, Handler, Output, ProcessError, Reactor, ReactorHandle, ReactorState};
pub use rendezvous::RendezvousError;

use std::time::Duration;

/// Default per-call rendezvous timeout.
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);
