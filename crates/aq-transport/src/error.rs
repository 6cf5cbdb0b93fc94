//! Error types for transport operations.

use std::time::Duration;
use thiserror::Error;

/// Broker code signalling that a dequeue wait elapsed without a message.
pub const TIMEOUT_OR_END_OF_FETCH: i32 = 25228;

/// Broker code for a queue that does not exist.
pub const QUEUE_DOES_NOT_EXIST: i32 = 24010;

/// Broker code reported when a commit loses a lock conflict.
pub const DEADLOCK_DETECTED: i32 = 60;

/// Error returned by a host's processing callback.
pub type ProcessingError = Box<dyn std::error::Error + Send + Sync>;

/// Comprehensive error type for all transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Broker error ORA-{code:05}: {message}")]
    Broker { code: i32, message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Transaction failed: {message}")]
    Transaction { message: String },

    #[error("Queue handle for '{queue_name}' has no open connection")]
    NotOpen { queue_name: String },

    #[error("Polling engine for '{queue_name}' is already started")]
    AlreadyStarted { queue_name: String },

    #[error("Polling engine for '{queue_name}' is not running")]
    NotRunning { queue_name: String },

    #[error("Polling loops for '{queue_name}' did not exit within {waited:?}")]
    StopTimedOut { queue_name: String, waited: Duration },

    #[error("Receive loop panicked: {message}")]
    WorkerPanicked { message: String },

    #[error("Failed to start worker '{worker}': {message}")]
    WorkerSpawnFailed { worker: String, message: String },

    #[error("Envelope codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl TransportError {
    /// Build a broker error from a numeric code.
    pub fn broker(code: i32, message: impl Into<String>) -> Self {
        Self::Broker {
            code,
            message: message.into(),
        }
    }

    /// The broker's "wait elapsed, nothing to dequeue" signal.
    pub fn no_message() -> Self {
        Self::broker(
            TIMEOUT_OR_END_OF_FETCH,
            "timeout or end-of-fetch during message dequeue",
        )
    }

    /// True when the error is the broker's normal empty-queue signal
    pub fn is_no_message(&self) -> bool {
        matches!(
            self,
            Self::Broker {
                code: TIMEOUT_OR_END_OF_FETCH,
                ..
            }
        )
    }

    /// Check if error is transient and the operation may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Broker { code, .. } => *code != QUEUE_DOES_NOT_EXIST,
            Self::ConnectionFailed { .. } => true,
            Self::QueueNotFound { .. } => false,
            Self::Transaction { .. } => true,
            Self::NotOpen { .. } => false,
            Self::AlreadyStarted { .. } => false,
            Self::NotRunning { .. } => false,
            Self::StopTimedOut { .. } => false,
            Self::WorkerPanicked { .. } => true,
            Self::WorkerSpawnFailed { .. } => false,
            Self::Codec(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }
}

/// Errors raised while encoding or decoding the XML envelope.
///
/// Any of these on decode means the payload is treated as poison.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Envelope is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed envelope XML: {message}")]
    Xml { message: String },

    #[error("Envelope root element must be TransportMessage, found '{found}'")]
    UnexpectedRoot { found: String },

    #[error("Envelope ended before element '{element}' was closed")]
    Truncated { element: String },

    #[error("Body is flagged as base64 but cannot be decoded: {message}")]
    InvalidBase64 { message: String },

    #[error("Unknown message intent '{value}'")]
    UnknownMessageIntent { value: String },

    #[error("Invalid Recoverable value '{value}'")]
    InvalidRecoverable { value: String },

    #[error("Invalid reply-to address '{value}'")]
    InvalidAddress { value: String },

    #[error("Duplicate header key '{key}'")]
    DuplicateHeader { key: String },

    #[error("Header item is missing its {part}")]
    IncompleteHeader { part: String },

    #[error("Header '{key}' contains characters that are not legal in XML")]
    IllegalHeaderText { key: String },

    #[error("Raw message carries no message id")]
    MissingMessageId,
}

impl From<quick_xml::Error> for CodecError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Xml {
            message: e.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error(
        "Transactional receive cannot be combined with suppressed distributed transactions"
    )]
    TransactionalWithSuppressedTransactions,
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
