//! Transport settings loaded from files and the environment.
//!
//! Sources, later overriding earlier:
//!  1. `/etc/aq-transport/transport.yaml`
//!  2. `./config/transport.yaml`
//!  3. An explicit file, from the caller or `AQT_CONFIG_FILE`
//!  4. Environment variables prefixed `AQT__`, e.g. `AQT__MAX_CONCURRENCY=4`
//!     or `AQT__TRANSACTIONS__TIMEOUT_SECONDS=30`
//!
//! Every field has a default, so missing files are not an error. A file that
//! is named explicitly must exist.

use crate::broker::IsolationLevel;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connection::{extract_schema_name, ConnectionParams};
use crate::error::ConfigurationError;
use crate::message::Address;
use crate::receive::TransactionSettings;
use crate::sender::MessageSender;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable naming an explicit settings file
pub const CONFIG_FILE_ENV: &str = "AQT_CONFIG_FILE";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "AQT";

/// Complete transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Broker connection string; may carry a `Queue Schema` key
    pub connection_string: String,

    /// Schema used when the connection string names none
    pub schema: Option<String>,

    /// Queue polled for work, as `queue` or `queue@schema`
    pub work_queue: String,

    /// Queue receiving poison messages
    pub error_queue: String,

    /// Per-destination connection overrides, keyed by queue
    pub destinations: BTreeMap<String, DestinationSettings>,

    pub transactions: TransactionConfig,

    /// Number of polling loops
    pub max_concurrency: usize,

    /// Purge the work queue before the loops start
    pub purge_on_startup: bool,

    /// Run each loop on its own OS thread
    pub dedicated_threads: bool,

    /// How long one receive waits on an empty queue (milliseconds)
    pub receive_wait_ms: u64,

    /// How long stop waits for loops to drain (seconds)
    pub stop_timeout_seconds: u64,

    pub circuit_breaker: CircuitBreakerSettings,

    pub logging: LoggingConfig,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            schema: None,
            work_queue: String::new(),
            error_queue: "error".to_string(),
            destinations: BTreeMap::new(),
            transactions: TransactionConfig::default(),
            max_concurrency: 1,
            purge_on_startup: false,
            dedicated_threads: false,
            receive_wait_ms: 1000,
            stop_timeout_seconds: 30,
            circuit_breaker: CircuitBreakerSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Connection override for one destination queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationSettings {
    pub connection_string: Option<String>,
    pub schema: Option<String>,
}

/// Transaction behavior of the receive loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub enabled: bool,
    pub suppress_distributed_transactions: bool,
    pub isolation_level: IsolationLevel,
    pub timeout_seconds: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppress_distributed_transactions: false,
            isolation_level: IsolationLevel::default(),
            timeout_seconds: 60,
        }
    }
}

/// Circuit breaker timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub time_to_wait_before_triggering_seconds: u64,
    pub delay_after_failure_ms: u64,
    pub cool_down_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            time_to_wait_before_triggering_seconds: 30,
            delay_after_failure_ms: 1000,
            cool_down_seconds: 10,
        }
    }
}

/// Logging configuration, applied by the binary that installs a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl TransportSettings {
    /// Load layered settings.
    ///
    /// `explicit` wins over `AQT_CONFIG_FILE`; either must name an existing
    /// file whose format follows its extension.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder()
            .add_source(
                config::File::with_name("/etc/aq-transport/transport")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            )
            .add_source(
                config::File::with_name("config/transport")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            );

        let from_env = std::env::var(CONFIG_FILE_ENV)
            .ok()
            .filter(|path| !path.is_empty());
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| from_env.map(Into::into));
        if let Some(path) = explicit {
            info!(path = %path.display(), "Loading transport settings from explicit path");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })
    }

    /// Check the settings can run a polling engine
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "connection_string".to_string(),
            });
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        if self.receive_wait_ms == 0 {
            return Err(invalid("receive_wait_ms must be greater than zero"));
        }

        self.work_queue_address()?;
        self.error_queue_address()?;
        for queue in self.destinations.keys() {
            parse_queue("destinations", queue)?;
        }

        if self.transactions.enabled {
            if self.transactions.suppress_distributed_transactions {
                return Err(ConfigurationError::TransactionalWithSuppressedTransactions);
            }
            if self.transactions.timeout_seconds == 0 {
                return Err(invalid("transactions.timeout_seconds must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Connection parameters for the work queue.
    ///
    /// A `Queue Schema` key in the connection string is removed and wins
    /// over the configured `schema`.
    pub fn connection_params(&self) -> Result<ConnectionParams, ConfigurationError> {
        let (connection_string, schema) = extract_schema_name(&self.connection_string);
        ConnectionParams::new(
            None,
            schema.as_deref(),
            &connection_string,
            self.schema.as_deref(),
        )
    }

    pub fn work_queue_address(&self) -> Result<Address, ConfigurationError> {
        parse_queue("work_queue", &self.work_queue)
    }

    pub fn error_queue_address(&self) -> Result<Address, ConfigurationError> {
        parse_queue("error_queue", &self.error_queue)
    }

    pub fn transaction_settings(&self) -> TransactionSettings {
        TransactionSettings {
            is_transactional: self.transactions.enabled,
            suppress_distributed_transactions: self.transactions.suppress_distributed_transactions,
            isolation_level: self.transactions.isolation_level,
            timeout: Duration::from_secs(self.transactions.timeout_seconds),
        }
    }

    /// Breaker configuration named after the guarded queue
    pub fn circuit_breaker_config(&self, name: impl Into<String>) -> CircuitBreakerConfig {
        let timings = &self.circuit_breaker;
        CircuitBreakerConfig {
            name: name.into(),
            time_to_wait_before_triggering: Duration::from_secs(
                timings.time_to_wait_before_triggering_seconds,
            ),
            delay_after_failure: Duration::from_millis(timings.delay_after_failure_ms),
            cool_down: Duration::from_secs(timings.cool_down_seconds),
        }
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    /// Sender routing each configured destination through its override
    pub fn message_sender(&self, transport: Transport) -> MessageSender {
        self.destinations
            .iter()
            .fold(MessageSender::new(transport), |sender, (queue, destination)| {
                sender.with_destination(
                    queue.clone(),
                    destination.connection_string.as_deref(),
                    destination.schema.as_deref(),
                )
            })
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
}

fn parse_queue(key: &str, value: &str) -> Result<Address, ConfigurationError> {
    value.parse().map_err(|e| ConfigurationError::Invalid {
        message: format!("{}: {}", key, e),
    })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
