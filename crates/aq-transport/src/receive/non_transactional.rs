//! Non-transactional receive strategy.

use super::{invoke_processor, MessageProcessor, ReceiveStrategy, StorageContext};
use crate::error::TransportError;
use crate::message::{Address, MessageReadResult, ReceiveResult};
use crate::queue_handle::QueueHandle;
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Receives without a transaction.
///
/// A dequeued message is gone from the queue at once; processor failures are
/// reported but nothing is rolled back.
pub struct NonTransactionalReceiveStrategy {
    transport: Transport,
    error_queue: QueueHandle,
    processor: Arc<dyn MessageProcessor>,
}

impl NonTransactionalReceiveStrategy {
    pub fn new(
        transport: Transport,
        error_queue: &Address,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        Self {
            error_queue: transport.queue_handle(error_queue),
            transport,
            processor,
        }
    }

    async fn receive(&self, queue: &mut QueueHandle) -> Result<ReceiveResult, TransportError> {
        queue
            .open(self.transport.connection_params().connection_string())
            .await?;

        match queue.try_receive().await? {
            MessageReadResult::NoMessage => Ok(ReceiveResult::NoMessage),
            MessageReadResult::Poison(raw) => {
                warn!(
                    queue = %queue.queue_name(),
                    error_queue = %self.error_queue.queue_name(),
                    "Forwarding poison message to the error queue"
                );
                self.error_queue.send(raw, queue.connection_mut()?).await?;
                Ok(ReceiveResult::NoMessage)
            }
            MessageReadResult::Success(mut message) => {
                let mut context = StorageContext::new(queue.connection_mut()?, &self.transport);
                match invoke_processor(self.processor.as_ref(), &mut message, &mut context).await {
                    Ok(_) => Ok(ReceiveResult::Received(message)),
                    Err(error) => Ok(ReceiveResult::FailedProcessing { message, error }),
                }
            }
        }
    }
}

#[async_trait]
impl ReceiveStrategy for NonTransactionalReceiveStrategy {
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
#[path = "non_transactional_tests.rs"]
mod tests;
