//! Transactional receive strategy.

use super::{invoke_processor, MessageProcessor, ReceiveStrategy, StorageContext};
use crate::broker::TransactionOptions;
use crate::error::TransportError;
use crate::message::{Address, MessageReadResult, ReceiveResult};
use crate::queue_handle::QueueHandle;
use crate::transaction::TransactionScope;
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives, processes and forwards poison inside one broker transaction.
///
/// Each cycle:
/// 1. opens the handle and begins a transaction on its connection
/// 2. receives one message
/// 3. on poison, forwards the raw payload to the error queue and commits
/// 4. on a message, runs the processor and commits eagerly if it succeeded
/// 5. rolls back anything not committed, then releases the handle
pub struct TransactionalReceiveStrategy {
    transport: Transport,
    error_queue: QueueHandle,
    options: TransactionOptions,
    processor: Arc<dyn MessageProcessor>,
}

impl TransactionalReceiveStrategy {
    pub fn new(
        transport: Transport,
        error_queue: &Address,
        options: TransactionOptions,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        Self {
            error_queue: transport.queue_handle(error_queue),
            transport,
            options,
            processor,
        }
    }

    async fn receive(&self, queue: &mut QueueHandle) -> Result<ReceiveResult, TransportError> {
        queue
            .open(self.transport.connection_params().connection_string())
            .await?;

        let mut scope = TransactionScope::begin(queue.connection_mut()?, &self.options).await?;
        let result = self.receive_in_scope(queue, &mut scope).await;

        if let Ok(connection) = queue.connection_mut() {
            scope.dispose(connection).await;
        }
        result
    }

    async fn receive_in_scope(
        &self,
        queue: &mut QueueHandle,
        scope: &mut TransactionScope,
    ) -> Result<ReceiveResult, TransportError> {
        match queue.try_receive().await? {
            MessageReadResult::NoMessage => {
                scope.complete(queue.connection_mut()?).await?;
                Ok(ReceiveResult::NoMessage)
            }
            MessageReadResult::Poison(raw) => {
                warn!(
                    queue = %queue.queue_name(),
                    error_queue = %self.error_queue.queue_name(),
                    "Forwarding poison message to the error queue"
                );
                self.error_queue.send(raw, queue.connection_mut()?).await?;
                scope.complete(queue.connection_mut()?).await?;
                Ok(ReceiveResult::NoMessage)
            }
            MessageReadResult::Success(mut message) => {
                let outcome = {
                    let mut context = StorageContext::new(queue.connection_mut()?, &self.transport);
                    invoke_processor(self.processor.as_ref(), &mut message, &mut context).await
                };

                match outcome {
                    Ok(true) => match scope.complete(queue.connection_mut()?).await {
                        Ok(()) => Ok(ReceiveResult::Received(message)),
                        Err(e) => {
                            warn!(
                                queue = %queue.queue_name(),
                                message_id = %message.id,
                                error = %e,
                                "Commit failed after processing; the message will be redelivered"
                            );
                            Ok(ReceiveResult::FailedProcessing {
                                message,
                                error: Box::new(e),
                            })
                        }
                    },
                    Ok(false) => {
                        debug!(
                            queue = %queue.queue_name(),
                            message_id = %message.id,
                            "Processor declined the message; rolling back"
                        );
                        Ok(ReceiveResult::Received(message))
                    }
                    Err(error) => Ok(ReceiveResult::FailedProcessing { message, error }),
                }
            }
        }
    }
}

#[async_trait]
impl ReceiveStrategy for TransactionalReceiveStrategy {
    async fn try_receive_from(
        &self,
        queue: &mut QueueHandle,
    ) -> Result<ReceiveResult, TransportError> {
        let result = self.receive(queue).await;
        queue.complete().await;
        result
    }
}

#[cfg(test)]
#[path = "transactional_tests.rs"]
mod tests;
