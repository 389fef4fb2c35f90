//! Reverb worker - generic reactor binary.
//!
//! Consumes the configured primary topic and lets every message script its
//! own dependency map through the `deps` envelope field:
//!
//! ```json
//! {
//!   "return-topic": "orders.replies",
//!   "deps": {
//!     "total":    {"topic": "pricing.add", "args": [100, 20]},
//!     "invoiced": {"topic": "billing.invoice", "args": ["acme"],
//!                  "deps": ["total"], "arg-in-fn": "append"}
//!   }
//! }
//! ```
//!
//! The final result is the mapping of node names to subtask results; it is
//! produced to `return-topic` when present and logged via the output
//! channel.
//!
//! ## Configuration
//!
//! - `REVERB_CONFIG`: path to the TOML config (default: `./reverb.toml`)
//! - `RUST_LOG`: logging level (default: "info")

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use reverb::config::Config;
use reverb::dag::{ResultMap, TaskMap};
use reverb::payload::{Message, DEPS};
use reverb::reactor::{Handler, Reactor};
use reverb::shutdown::ShutdownSignal;

/// Handler whose dependency map comes from the message payload itself.
struct Scripted;

#[async_trait]
impl Handler for Scripted {
    fn dependencies(&self, message: &Message) -> TaskMap {
        let Some(spec) = message.value.get(DEPS) else {
            return TaskMap::new();
        };
        match serde_json::from_value(spec.clone()) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "unusable deps field; processing without dependencies"
                );
                TaskMap::new()
            }
        }
    }

    async fn process(&self, _message: &Message, results: &ResultMap) -> Value {
        let mut out = serde_json::Map::new();
        for (name, task) in results {
            out.insert(name.clone(), task.result.clone());
        }
        Value::Object(out)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "failed to load config, using defaults");
            Config::default()
        }
    };

    info!(
        brokers = %config.broker.brokers,
        topic = %config.reactor.topic,
        group = %config.reactor.group,
        "reverb worker starting"
    );

    let broker = Arc::new(config.connect()?);

    let (sender, receiver) = match config.output_channel() {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };

    if let Some(mut results) = receiver {
        tokio::spawn(async move {
            while let Some(item) = results.recv().await {
                match item {
                    Ok(value) => info!(result = %value, "message completed"),
                    Err(e) => warn!(error = %e, "message failed"),
                }
            }
        });
    }

    let elements = config.elements(broker, sender);
    let handle = Reactor::new(Scripted).start(elements);

    ShutdownSignal::new().wait().await;

    handle.stop().await;
    info!("worker shutdown complete");
    Ok(())
}
