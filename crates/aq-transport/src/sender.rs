//! Outgoing work items: encode and enqueue.

use crate::broker::BrokerConnection;
use crate::codec;
use crate::connection::ConnectionParams;
use crate::error::TransportError;
use crate::message::{Address, RawMessage, SendOptions, TransportMessage};
use crate::transport::Transport;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Sends work items, optionally routing destinations to their own databases.
///
/// # Example
///
/// ```rust
/// use aq_transport::{
///     ConnectionParams, InMemoryBroker, MessageSender, SendOptions, Transport, TransportMessage,
/// };
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// broker.create_queue("SALES.ORDERS");
/// let params = ConnectionParams::new(None, None, "Data Source=orcl", Some("SALES")).unwrap();
/// let sender = MessageSender::new(Transport::new(Arc::new(broker.clone()), params));
///
/// let message = TransportMessage::new(&b"order-1"[..]);
/// sender
///     .send(&message, &"orders".parse().unwrap(), &SendOptions::default())
///     .await
///     .unwrap();
/// assert_eq!(broker.depth("SALES.ORDERS"), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct MessageSender {
    transport: Transport,
    destinations: HashMap<String, ConnectionParams>,
}

impl MessageSender {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            destinations: HashMap::new(),
        }
    }

    /// Route a destination queue through its own connection string or schema
    pub fn with_destination(
        mut self,
        queue: impl Into<String>,
        connection_string: Option<&str>,
        schema: Option<&str>,
    ) -> Self {
        let params = self
            .transport
            .connection_params()
            .make_specific(connection_string, schema);
        self.destinations.insert(queue.into(), params);
        self
    }

    /// Connection parameters used for a destination
    pub fn connection_params_for(&self, destination: &Address) -> &ConnectionParams {
        self.destinations
            .get(destination.queue())
            .unwrap_or_else(|| self.transport.connection_params())
    }

    /// Send on a dedicated connection; the item is visible immediately.
    pub async fn send(
        &self,
        message: &TransportMessage,
        destination: &Address,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        let params = self.connection_params_for(destination).clone();
        let transport = self.transport.with_connection_params(params);

        let mut connection = transport
            .broker()
            .connect(transport.connection_params().connection_string())
            .await?;
        let result = enqueue_on(&transport, connection.as_mut(), message, destination, options).await;

        if let Err(e) = connection.close().await {
            warn!(destination = %destination, error = %e, "Failed to close send connection");
        }
        result
    }

    /// Send through an existing connection, joining its transaction if it
    /// has one and enlistment is allowed.
    pub async fn send_on(
        &self,
        connection: &mut dyn BrokerConnection,
        message: &TransportMessage,
        destination: &Address,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        enqueue_on(&self.transport, connection, message, destination, options).await
    }
}

/// Encode a work item and enqueue it on the destination's queue
pub(crate) async fn enqueue_on(
    transport: &Transport,
    connection: &mut dyn BrokerConnection,
    message: &TransportMessage,
    destination: &Address,
    options: &SendOptions,
) -> Result<(), TransportError> {
    let payload = codec::encode(message, options)?;
    let handle = transport.queue_handle(destination);
    debug!(
        destination = %handle.queue_name(),
        message_id = %message.id,
        "Sending message"
    );
    handle
        .send(RawMessage::new(payload, message.correlation_id.clone()), connection)
        .await
}

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;
