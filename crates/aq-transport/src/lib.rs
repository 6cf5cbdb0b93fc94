//! # AQ Transport
//!
//! Reliable consumer/producer engine for work queues hosted in a database
//! broker with advanced-queuing support.
//!
//! This library provides:
//! - A self-describing XML envelope codec that quarantines undecodable payloads
//! - Queue handles owning one broker connection each
//! - Transactional and non-transactional receive strategies
//! - A supervised pool of polling loops guarded by a circuit breaker
//! - A sender for outgoing work items
//! - An in-memory broker implementing the full broker seam
//!
//! ## Module Organization
//!
//! - [`error`] - Error types and broker error codes
//! - [`message`] - Work items, addresses and receive outcomes
//! - [`codec`] - Envelope encoding and decoding
//! - [`broker`] - The broker seam traits
//! - [`providers`] - Broker implementations
//! - [`queue_handle`] - Connection-owning queue handles
//! - [`receive`] - Receive strategies and the strategy factory
//! - [`polling`] - The polling engine
//! - [`circuit_breaker`] - Failure tracking for the polling loops
//! - [`sender`] - Outgoing work items
//! - [`config`] - Layered settings

// Module declarations
pub mod broker;
pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod naming;
pub mod polling;
pub mod providers;
pub mod queue_handle;
pub mod receive;
pub mod sender;
pub mod transaction;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use broker::{
    Broker, BrokerConnection, DequeueOptions, IsolationLevel, QueueCreator, QueuePurger,
    TransactionOptions, VisibilityMode,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState, CriticalErrorNotifier,
    DefaultCircuitBreaker, LoggingCriticalErrorNotifier,
};
pub use crate::config::TransportSettings;
pub use connection::{ConnectionParams, EnlistmentCache};
pub use error::{
    CodecError, ConfigurationError, ProcessingError, TransportError, ValidationError,
};
pub use message::{
    Address, Headers, MessageIntent, MessageReadResult, RawMessage, ReceiveResult, SendOptions,
    TransportMessage,
};
pub use naming::{DefaultQueueNamePolicy, QueueNamePolicy};
pub use polling::{
    CompletionHandler, DedicatedThreadExecutor, LoggingCompletionHandler, PollingEngine,
    TokioExecutor, WorkerExecutor,
};
pub use providers::{InMemoryBroker, InMemoryConfig};
pub use queue_handle::QueueHandle;
pub use receive::{
    processor_fn, MessageProcessor, ReceiveStrategy, ReceiveStrategyFactory, StorageContext,
    TransactionSettings,
};
pub use sender::MessageSender;
pub use transaction::TransactionScope;
pub use transport::Transport;
