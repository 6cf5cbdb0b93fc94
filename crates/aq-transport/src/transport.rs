//! Shared transport context used to mint queue handles.

use crate::broker::{Broker, DequeueOptions};
use crate::connection::{ConnectionParams, EnlistmentCache};
use crate::message::Address;
use crate::naming::{qualify, DefaultQueueNamePolicy, QueueNamePolicy};
use crate::queue_handle::QueueHandle;
use std::sync::Arc;
use std::time::Duration;

/// Immutable bundle of everything a queue handle needs.
///
/// Cloning is cheap; all clones share the broker and the enlistment cache.
#[derive(Clone)]
pub struct Transport {
    broker: Arc<dyn Broker>,
    connection: ConnectionParams,
    naming: Arc<dyn QueueNamePolicy>,
    enlistment: Arc<EnlistmentCache>,
    receive_wait: Duration,
}

impl Transport {
    pub fn new(broker: Arc<dyn Broker>, connection: ConnectionParams) -> Self {
        Self {
            broker,
            connection,
            naming: Arc::new(DefaultQueueNamePolicy),
            enlistment: Arc::new(EnlistmentCache::new()),
            receive_wait: DequeueOptions::default().wait,
        }
    }

    pub fn with_naming_policy(mut self, naming: Arc<dyn QueueNamePolicy>) -> Self {
        self.naming = naming;
        self
    }

    /// How long a receive waits on an empty queue before reporting no message
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Same broker and caches, different connection string or schema
    pub fn with_connection_params(&self, connection: ConnectionParams) -> Self {
        Self {
            connection,
            ..self.clone()
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn connection_params(&self) -> &ConnectionParams {
        &self.connection
    }

    pub fn enlistment(&self) -> &Arc<EnlistmentCache> {
        &self.enlistment
    }

    /// Schema-qualified broker name of the queue behind an address.
    ///
    /// An address scope names the schema and wins over the configured one.
    pub fn queue_name(&self, address: &Address) -> String {
        let schema = address.scope().or(self.connection.schema());
        qualify(schema, &self.naming.queue_name(address))
    }

    /// Create an unopened handle bound to the address
    pub fn queue_handle(&self, address: &Address) -> QueueHandle {
        QueueHandle::new(
            Arc::clone(&self.broker),
            self.queue_name(address),
            Arc::clone(&self.enlistment),
            DequeueOptions {
                wait: self.receive_wait,
            },
        )
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
