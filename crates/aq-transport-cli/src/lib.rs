//! # aqt
//!
//! Command-line tools for inspecting aq-transport envelopes and settings.
//!
//! This module provides CLI commands for:
//! - Decoding an envelope into a JSON work item
//! - Encoding a JSON work item into an envelope
//! - Validating and showing the resolved transport settings

use aq_transport::codec;
use aq_transport::{
    Address, CodecError, ConfigurationError, RawMessage, SendOptions, TransportMessage,
    TransportSettings,
};
use aq_transport::config::LoggingConfig;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// aqt - envelope and settings tools for aq-transport
#[derive(Parser)]
#[command(name = "aqt")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Envelope and settings tools for aq-transport")]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, env = "AQT_CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level; defaults to the configured level
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Decode an envelope and print the work item as JSON
    Decode {
        /// File holding the raw envelope
        file: PathBuf,

        /// Broker message id in hex; a random id is used when omitted
        #[arg(long)]
        message_id: Option<String>,

        /// Broker-level correlation id
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Encode a JSON work item into an envelope
    Encode {
        /// File holding the JSON work item
        file: PathBuf,

        /// Reply-to address written into the envelope
        #[arg(long)]
        reply_to: Option<String>,

        /// Write the envelope here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate settings
    Config {
        /// Show resolved settings
        #[arg(short, long)]
        show: bool,

        /// Output format for settings
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Settings output formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Envelope could not be decoded: {0}")]
    Codec(#[from] CodecError),

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Codec(_) => 2,
            Self::Serialization { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::Logging { .. } => 6,
        }
    }
}

fn serialization(e: impl std::fmt::Display) -> CliError {
    CliError::Serialization {
        message: e.to_string(),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let Cli {
        config,
        log_level,
        json_logs,
        command,
    } = Cli::parse();
    let mut stdout = std::io::stdout().lock();

    match command {
        Commands::Decode {
            file,
            message_id,
            correlation_id,
        } => {
            initialize_logging(log_level.as_deref(), json_logs, &LoggingConfig::default())?;
            execute_decode_command(&file, message_id.as_deref(), correlation_id, &mut stdout)
        }
        Commands::Encode {
            file,
            reply_to,
            output,
        } => {
            initialize_logging(log_level.as_deref(), json_logs, &LoggingConfig::default())?;
            let envelope = execute_encode_command(&file, reply_to.as_deref())?;
            match output {
                Some(path) => std::fs::write(&path, &envelope)?,
                None => stdout.write_all(&envelope)?,
            }
            Ok(())
        }
        Commands::Config { show, format } => {
            let settings = TransportSettings::load(config.as_deref())?;
            initialize_logging(log_level.as_deref(), json_logs, &settings.logging)?;
            execute_config_command(&settings, show, format, &mut stdout)
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins, then the command-line level, then the configured level.
pub fn initialize_logging(
    level: Option<&str>,
    json: bool,
    configured: &LoggingConfig,
) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.unwrap_or(&configured.level)).map_err(|e| {
            CliError::InvalidArgument {
                arg: "log-level".to_string(),
                message: e.to_string(),
            }
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json || configured.json_format {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Parse a hex message id, or mint a random GUID-shaped one
fn message_id_bytes(message_id: Option<&str>) -> Result<Vec<u8>, CliError> {
    match message_id {
        Some(text) => hex::decode(text.trim()).map_err(|e| CliError::InvalidArgument {
            arg: "message-id".to_string(),
            message: e.to_string(),
        }),
        None => Ok(uuid::Uuid::new_v4().to_bytes_le().to_vec()),
    }
}

/// Decode an envelope into pretty-printed JSON
pub fn decode_envelope(
    payload: Vec<u8>,
    message_id: Option<&str>,
    correlation_id: Option<String>,
) -> Result<String, CliError> {
    let raw = RawMessage::new(payload, correlation_id).with_message_id(message_id_bytes(message_id)?);
    let message = codec::decode(&raw)?;
    debug!(message_id = %message.id, "Decoded envelope");
    serde_json::to_string_pretty(&message).map_err(serialization)
}

/// Encode a JSON work item into an envelope
pub fn encode_work_item(json: &[u8], reply_to: Option<&str>) -> Result<Vec<u8>, CliError> {
    let message: TransportMessage = serde_json::from_slice(json).map_err(serialization)?;

    let mut options = SendOptions::default();
    if let Some(address) = reply_to {
        let address: Address = address.parse().map_err(|e: aq_transport::ValidationError| {
            CliError::InvalidArgument {
                arg: "reply-to".to_string(),
                message: e.to_string(),
            }
        })?;
        options = options.with_reply_to_address(address);
    }

    Ok(codec::encode(&message, &options)?.to_vec())
}

/// Render settings in the requested format
pub fn render_settings(
    settings: &TransportSettings,
    format: ConfigFormat,
) -> Result<String, CliError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(settings).map_err(serialization),
        ConfigFormat::Json => serde_json::to_string_pretty(settings).map_err(serialization),
    }
}

/// Execute decode command
fn execute_decode_command(
    file: &Path,
    message_id: Option<&str>,
    correlation_id: Option<String>,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let payload = std::fs::read(file)?;
    let json = decode_envelope(payload, message_id, correlation_id)?;
    writeln!(out, "{}", json)?;
    Ok(())
}

/// Execute encode command
fn execute_encode_command(file: &Path, reply_to: Option<&str>) -> Result<Vec<u8>, CliError> {
    let json = std::fs::read(file)?;
    let envelope = encode_work_item(&json, reply_to)?;
    info!(file = %file.display(), bytes = envelope.len(), "Encoded work item");
    Ok(envelope)
}

/// Execute config command
pub fn execute_config_command(
    settings: &TransportSettings,
    show: bool,
    format: ConfigFormat,
    out: &mut impl Write,
) -> Result<(), CliError> {
    settings.validate()?;
    info!(work_queue = %settings.work_queue, "Settings are valid");

    if show {
        write!(out, "{}", render_settings(settings, format)?)?;
    } else {
        writeln!(out, "Settings are valid")?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
