//! Configuration.
//!
//! Loaded from a TOML file with `${ENV_VAR}` substitution applied before
//! parsing. Broker-facing key/value tables (`[reactor.consumer]`,
//! `[producer]`, `[rendezvous.consumer]`) are opaque: they are handed to the
//! broker client untouched.
//!
//! # Example
//!
//! ```toml
//! [broker]
//! brokers = "${KAFKA_BROKERS}"
//! replication = 1
//!
//! [reactor]
//! topic = "orders.jobs"
//! group = "orders_workers"
//!
//! [reactor.consumer]
//! "auto.offset.reset" = "earliest"
//!
//! [rendezvous]
//! timeout-ms = 30000
//!
//! [channel]
//! capacity = 64
//!
//! [dlq]
//! topic = "orders.dead-letters"
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::broker::{Broker, BrokerError, BrokerProps, KafkaBroker};
use crate::reactor::{Elements, Output};

/// Environment variable naming the config file path.
pub const CONFIG_PATH_VAR: &str = "REVERB_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "reverb.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub reactor: ReactorConfig,

    /// Producer properties, passed through to the broker client.
    #[serde(default)]
    pub producer: HashMap<String, String>,

    #[serde(default)]
    pub rendezvous: RendezvousConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub dlq: DlqConfig,
}

/// Broker connection settings.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Bootstrap list; also the coordination endpoint for topic admin.
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Replication factor for created topics (ephemeral ones included).
    #[serde(default = "default_replication")]
    pub replication: i32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            replication: default_replication(),
        }
    }
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_replication() -> i32 {
    1
}

/// Primary-topic consumption settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ReactorConfig {
    /// Primary topic to consume.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group for the primary consumer.
    #[serde(default = "default_group")]
    pub group: String,

    /// Extra consumer properties, passed through to the broker client.
    #[serde(default)]
    pub consumer: HashMap<String, String>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            group: default_group(),
            consumer: HashMap::new(),
        }
    }
}

fn default_topic() -> String {
    "reverb.jobs".to_string()
}

fn default_group() -> String {
    "reverb_workers".to_string()
}

/// Rendezvous settings.
#[derive(Debug, Deserialize, Clone)]
pub struct RendezvousConfig {
    /// Per-call reply timeout in milliseconds.
    #[serde(rename = "timeout-ms", default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Reply consumer properties, passed through to the broker client.
    #[serde(default)]
    pub consumer: HashMap<String, String>,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            consumer: HashMap::new(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Output channel settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Bound of the output channel; 0 disables it.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    64
}

/// Dead-letter settings.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DlqConfig {
    /// Topic to record failed messages on; unset disables dead-lettering.
    #[serde(default)]
    pub topic: Option<String>,
}

impl Config {
    /// Load from `$REVERB_CONFIG`, falling back to `./reverb.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_path(path)
    }

    /// Load from an explicit path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env(content);
        let config: Self = toml::from_str(&substituted)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reactor.topic.is_empty() {
            return Err(ConfigError::Invalid("[reactor].topic must not be empty".into()));
        }
        if self.broker.replication < 1 {
            return Err(ConfigError::Invalid(
                "[broker].replication must be >= 1".into(),
            ));
        }
        if self.rendezvous.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "[rendezvous].timeout-ms must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// The rendezvous timeout as a duration.
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous.timeout_ms)
    }

    /// Primary consumer properties with the configured group applied.
    ///
    /// An explicit `group.id` in `[reactor.consumer]` wins over
    /// `[reactor].group`.
    pub fn primary_consumer_props(&self) -> BrokerProps {
        let mut props = self.reactor.consumer.clone();
        props
            .entry("group.id".to_string())
            .or_insert_with(|| self.reactor.group.clone());
        props
    }

    /// Connect a [`KafkaBroker`] per this configuration.
    pub fn connect(&self) -> Result<KafkaBroker, BrokerError> {
        KafkaBroker::new(&self.broker.brokers, &self.producer, self.broker.replication)
    }

    /// The output channel, if one is configured.
    pub fn output_channel(&self) -> Option<(mpsc::Sender<Output>, mpsc::Receiver<Output>)> {
        if self.channel.capacity == 0 {
            return None;
        }
        Some(mpsc::channel(self.channel.capacity))
    }

    /// Build an [`Elements`] bundle around `broker`.
    pub fn elements(
        &self,
        broker: Arc<dyn Broker>,
        output: Option<mpsc::Sender<Output>>,
    ) -> Elements {
        let mut elements = Elements::new(broker, self.reactor.topic.clone())
            .consumer_props(self.primary_consumer_props())
            .reply_props(self.rendezvous.consumer.clone())
            .rendezvous_timeout(self.rendezvous_timeout());

        if let Some(sender) = output {
            elements = elements.output(sender);
        }
        if let Some(topic) = &self.dlq.topic {
            elements = elements.dead_letters(topic.clone());
        }
        elements
    }
}

/// Replace `${VAR}` references with environment values.
///
/// Unset variables are left as-is (with a warning) so the TOML error points
/// at the offending value.
fn substitute_env(content: &str) -> String {
    let pattern = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(pattern) => pattern,
        Err(_) => return content.to_string(),
    };

    pattern
        .replace_all(content, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match env::var(name) {
                Ok(value) => value,
                Err(_) => {
                    warn!(variable = %name, "environment variable not set");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}
