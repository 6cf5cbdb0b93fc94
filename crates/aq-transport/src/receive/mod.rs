//! Receive strategies: one receive-and-process cycle with the right
//! transaction discipline and poison routing.
//!
//! # Variants
//!
//! - **Transactional**: dequeue, processing and poison forwarding share one
//!   broker transaction that commits only when processing succeeds
//! - **Non-transactional**: dequeue removes the message immediately and
//!   processing side effects are never undone
//!
//! [`ReceiveStrategyFactory`] picks the variant from [`TransactionSettings`]
//! and rejects combinations that cannot be honoured.

use crate::broker::{BrokerConnection, IsolationLevel, TransactionOptions};
use crate::error::{ConfigurationError, ProcessingError, TransportError};
use crate::message::{Address, ReceiveResult, SendOptions, TransportMessage};
use crate::queue_handle::QueueHandle;
use crate::sender;
use crate::transport::Transport;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

mod non_transactional;
mod transactional;

pub use non_transactional::NonTransactionalReceiveStrategy;
pub use transactional::TransactionalReceiveStrategy;

// ============================================================================
// Strategy and Processor Traits
// ============================================================================

/// Runs one receive cycle against a queue handle.
///
/// Implementations open the handle, receive at most one message and always
/// release the handle before returning, whatever the outcome.
#[async_trait]
pub trait ReceiveStrategy: Send + Sync {
    /// Run one cycle.
    ///
    /// # Returns
    ///
    /// - `Ok(ReceiveResult::NoMessage)`: nothing to process, or a poison
    ///   message was forwarded to the error queue
    /// - `Ok(ReceiveResult::Received(_))`: the processor ran successfully
    /// - `Ok(ReceiveResult::FailedProcessing { .. })`: the processor failed
    /// - `Err(_)`: a connectivity or broker failure
    async fn try_receive_from(&self, queue: &mut QueueHandle)
        -> Result<ReceiveResult, TransportError>;
}

/// The host's processing callback.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process a work item.
    ///
    /// Returns `Ok(true)` when handled. Under the transactional strategy
    /// `Ok(false)` leaves the transaction uncommitted so the item is
    /// redelivered.
    async fn process(
        &self,
        message: &mut TransportMessage,
        context: &mut StorageContext<'_>,
    ) -> Result<bool, ProcessingError>;
}

/// Adapts a closure into a [`MessageProcessor`]
pub struct FnProcessor<F>(F);

/// Build a processor from a synchronous closure
pub fn processor_fn<F>(f: F) -> FnProcessor<F>
where
    F: Fn(&mut TransportMessage) -> Result<bool, ProcessingError> + Send + Sync,
{
    FnProcessor(f)
}

#[async_trait]
impl<F> MessageProcessor for FnProcessor<F>
where
    F: Fn(&mut TransportMessage) -> Result<bool, ProcessingError> + Send + Sync,
{
    async fn process(
        &self,
        message: &mut TransportMessage,
        _context: &mut StorageContext<'_>,
    ) -> Result<bool, ProcessingError> {
        (self.0)(message)
    }
}

/// Run the processor, turning a panic into a processing error
async fn invoke_processor(
    processor: &dyn MessageProcessor,
    message: &mut TransportMessage,
    context: &mut StorageContext<'_>,
) -> Result<bool, ProcessingError> {
    match AssertUnwindSafe(processor.process(message, context))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(format!("processor panicked: {}", panic_message(panic.as_ref())).into()),
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Storage Context
// ============================================================================

/// Gives the processor the connection of the current receive cycle.
///
/// Storage work done through [`StorageContext::connection`] and sends made
/// through [`StorageContext::send`] join the cycle's transaction when there
/// is one.
pub struct StorageContext<'a> {
    connection: &'a mut dyn BrokerConnection,
    transport: &'a Transport,
}

impl<'a> StorageContext<'a> {
    pub fn new(connection: &'a mut dyn BrokerConnection, transport: &'a Transport) -> Self {
        Self {
            connection,
            transport,
        }
    }

    pub fn connection(&mut self) -> &mut dyn BrokerConnection {
        &mut *self.connection
    }

    pub fn in_transaction(&self) -> bool {
        self.connection.in_transaction()
    }

    /// Enqueue an outgoing work item on the cycle's connection
    pub async fn send(
        &mut self,
        message: &TransportMessage,
        destination: &Address,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        sender::enqueue_on(
            self.transport,
            &mut *self.connection,
            message,
            destination,
            options,
        )
        .await
    }
}

// ============================================================================
// Transaction Settings
// ============================================================================

/// Transaction settings supplied by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSettings {
    pub is_transactional: bool,
    /// The host forbids ambient/distributed transactions
    pub suppress_distributed_transactions: bool,
    pub isolation_level: IsolationLevel,
    pub timeout: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        let options = TransactionOptions::default();
        Self {
            is_transactional: true,
            suppress_distributed_transactions: false,
            isolation_level: options.isolation_level,
            timeout: options.timeout,
        }
    }
}

impl TransactionSettings {
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            isolation_level: self.isolation_level,
            timeout: self.timeout,
        }
    }
}

// ============================================================================
// Strategy Factory
// ============================================================================

/// Builds the receive strategy for a work queue.
pub struct ReceiveStrategyFactory {
    transport: Transport,
    error_queue: Address,
}

impl ReceiveStrategyFactory {
    /// # Arguments
    ///
    /// * `transport` - Shared transport context
    /// * `error_queue` - Destination for poison messages
    pub fn new(transport: Transport, error_queue: Address) -> Self {
        Self {
            transport,
            error_queue,
        }
    }

    /// Select the strategy variant.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::TransactionalWithSuppressedTransactions`]
    /// when a transactional strategy is requested while distributed
    /// transactions are suppressed.
    pub fn create(
        &self,
        settings: &TransactionSettings,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<Arc<dyn ReceiveStrategy>, ConfigurationError> {
        if !settings.is_transactional {
            return Ok(Arc::new(NonTransactionalReceiveStrategy::new(
                self.transport.clone(),
                &self.error_queue,
                processor,
            )));
        }

        if settings.suppress_distributed_transactions {
            return Err(ConfigurationError::TransactionalWithSuppressedTransactions);
        }
        if settings.timeout.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "transaction timeout must be greater than zero".to_string(),
            });
        }

        Ok(Arc::new(TransactionalReceiveStrategy::new(
            self.transport.clone(),
            &self.error_queue,
            settings.transaction_options(),
            processor,
        )))
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
