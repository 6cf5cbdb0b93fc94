//! Queue handle: one broker connection bound to one queue.

use crate::broker::{Broker, BrokerConnection, DequeueOptions, VisibilityMode};
use crate::codec;
use crate::connection::EnlistmentCache;
use crate::error::TransportError;
use crate::message::{MessageReadResult, RawMessage};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Owns a connection and the queue it is bound to.
///
/// A handle starts closed. [`QueueHandle::open`] connects, tags the session
/// and starts listening; [`QueueHandle::complete`] releases everything and may
/// be called any number of times. Each polling loop owns exactly one handle.
pub struct QueueHandle {
    broker: Arc<dyn Broker>,
    queue_name: String,
    enlistment: Arc<EnlistmentCache>,
    dequeue: DequeueOptions,
    connection: Option<Box<dyn BrokerConnection>>,
}

impl QueueHandle {
    /// Create a closed handle.
    ///
    /// # Arguments
    ///
    /// * `broker` - Broker used to open connections
    /// * `queue_name` - Fully qualified broker queue name
    /// * `enlistment` - Shared enlistment capability cache
    /// * `dequeue` - Options applied to every receive
    pub fn new(
        broker: Arc<dyn Broker>,
        queue_name: impl Into<String>,
        enlistment: Arc<EnlistmentCache>,
        dequeue: DequeueOptions,
    ) -> Self {
        Self {
            broker,
            queue_name: queue_name.into(),
            enlistment,
            dequeue,
            connection: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Identity registered on every connection the handle opens
    pub fn client_info(&self) -> String {
        format!("aq-transport receiver for {}", self.queue_name)
    }

    /// Open the connection, tag it and start listening on the queue.
    ///
    /// Does nothing if the handle is already open. On failure the partially
    /// opened connection is closed before the error is returned.
    pub async fn open(&mut self, connection_string: &str) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let mut connection = self.broker.connect(connection_string).await?;
        if let Err(e) = self.prepare(connection.as_mut()).await {
            if let Err(close_error) = connection.close().await {
                warn!(
                    queue = %self.queue_name,
                    error = %close_error,
                    "Failed to close connection after open failure"
                );
            }
            return Err(e);
        }

        debug!(queue = %self.queue_name, "Queue handle opened");
        self.connection = Some(connection);
        Ok(())
    }

    async fn prepare(&self, connection: &mut dyn BrokerConnection) -> Result<(), TransportError> {
        connection.set_client_info(&self.client_info()).await?;
        connection.listen(&self.queue_name).await
    }

    /// The open connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotOpen`] if the handle has not been opened.
    pub fn connection_mut(&mut self) -> Result<&mut dyn BrokerConnection, TransportError> {
        match self.connection.as_mut() {
            Some(connection) => Ok(connection.as_mut()),
            None => Err(TransportError::NotOpen {
                queue_name: self.queue_name.clone(),
            }),
        }
    }

    /// Dequeue and decode one message.
    ///
    /// The broker's end-of-fetch signal becomes [`MessageReadResult::NoMessage`].
    /// A payload that cannot be decoded becomes [`MessageReadResult::Poison`]
    /// carrying the raw bytes unchanged. Any other broker error propagates.
    pub async fn try_receive(&mut self) -> Result<MessageReadResult, TransportError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(TransportError::NotOpen {
                queue_name: self.queue_name.clone(),
            });
        };

        let raw = match connection.dequeue(&self.queue_name, &self.dequeue).await {
            Ok(raw) => raw,
            Err(e) if e.is_no_message() => return Ok(MessageReadResult::NoMessage),
            Err(e) => return Err(e),
        };

        match codec::decode(&raw) {
            Ok(message) => {
                debug!(queue = %self.queue_name, message_id = %message.id, "Message received");
                Ok(MessageReadResult::Success(message))
            }
            Err(e) => {
                error!(
                    queue = %self.queue_name,
                    message_id = %hex::encode(&raw.message_id),
                    error = %e,
                    "Message could not be decoded, treating it as poison"
                );
                Ok(MessageReadResult::Poison(raw))
            }
        }
    }

    /// Enqueue onto this handle's queue through the given connection.
    ///
    /// Visibility is deferred to commit only when the connection has an
    /// active transaction and its connection string allows enlistment.
    pub async fn send(
        &self,
        message: RawMessage,
        connection: &mut dyn BrokerConnection,
    ) -> Result<(), TransportError> {
        let visibility = if connection.in_transaction()
            && self.enlistment.can_enlist(connection.connection_string())
        {
            VisibilityMode::OnCommit
        } else {
            VisibilityMode::Immediate
        };

        debug!(queue = %self.queue_name, ?visibility, "Enqueueing message");
        connection.enqueue(&self.queue_name, message, visibility).await
    }

    /// Release the connection and queue binding. Safe to call repeatedly.
    pub async fn complete(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(queue = %self.queue_name, error = %e, "Failed to close queue connection");
            }
            debug!(queue = %self.queue_name, "Queue handle released");
        }
    }
}

#[cfg(test)]
#[path = "queue_handle_tests.rs"]
mod tests;
