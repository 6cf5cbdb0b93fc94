//! Broker seam: the operations the receive engine needs from a
//! database-hosted queue broker, plus the administrative collaborators.

use crate::error::TransportError;
use crate::message::{Address, RawMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Options
// ============================================================================

/// Isolation level requested for a receive transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
    #[default]
    ReadCommitted,
    ReadUncommitted,
    Snapshot,
}

/// Options for beginning a broker transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    /// Transactions still open after this long fail to commit
    pub timeout: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// When an enqueued item becomes visible to other consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityMode {
    Immediate,
    /// Visible only once the enlisted transaction commits
    OnCommit,
}

/// Options for a single dequeue call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueOptions {
    /// How long to wait for a message before reporting end-of-fetch
    pub wait: Duration,
}

impl Default for DequeueOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Connection Traits
// ============================================================================

/// Opens connections to the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection for the given connection string
    async fn connect(
        &self,
        connection_string: &str,
    ) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

/// One open broker session.
///
/// A connection carries at most one transaction at a time. Dequeues and
/// enqueues issued while a transaction is open belong to it.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Connection string the connection was opened with
    fn connection_string(&self) -> &str;

    /// Tag the session with a human-readable identity for operators
    async fn set_client_info(&mut self, client_info: &str) -> Result<(), TransportError>;

    /// Bind the queue and start waiting for messages on it
    async fn listen(&mut self, queue_name: &str) -> Result<(), TransportError>;

    /// Remove the next message, waiting up to `options.wait`.
    ///
    /// # Errors
    ///
    /// When the wait elapses the error satisfies
    /// [`TransportError::is_no_message`].
    async fn dequeue(
        &mut self,
        queue_name: &str,
        options: &DequeueOptions,
    ) -> Result<RawMessage, TransportError>;

    /// Add a message to a queue
    async fn enqueue(
        &mut self,
        queue_name: &str,
        message: RawMessage,
        visibility: VisibilityMode,
    ) -> Result<(), TransportError>;

    async fn begin_transaction(&mut self, options: &TransactionOptions)
        -> Result<(), TransportError>;

    async fn commit(&mut self) -> Result<(), TransportError>;

    async fn rollback(&mut self) -> Result<(), TransportError>;

    fn in_transaction(&self) -> bool;

    /// Close the session, rolling back any open transaction
    async fn close(&mut self) -> Result<(), TransportError>;
}

// ============================================================================
// Administrative Collaborators
// ============================================================================

/// Provisions the queue (and its table) behind an address.
#[async_trait]
pub trait QueueCreator: Send + Sync {
    async fn create_queue_if_absent(&self, address: &Address) -> Result<(), TransportError>;
}

/// Removes every message from a queue.
#[async_trait]
pub trait QueuePurger: Send + Sync {
    /// Returns the number of messages removed
    async fn purge(&self, queue_name: &str) -> Result<u64, TransportError>;
}
