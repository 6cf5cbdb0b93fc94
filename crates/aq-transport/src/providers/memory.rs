//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Hosts named FIFO queues shared by every connection
//! - Blocks dequeues up to the requested wait, then reports end-of-fetch
//! - Runs one transaction per connection; rollback restores dequeued
//!   messages to the head of their queue and discards deferred enqueues
//! - Enforces transaction timeouts at commit
//! - Counts connections, commits and rollbacks, and records client tags
//! - Injects connect, listen, dequeue and commit failures on request
//!
//! This broker is intended for:
//! - Unit and integration testing of receive strategies and polling loops
//! - Development without a database
//! - Reference behaviour for real broker bindings

use crate::broker::{
    Broker, BrokerConnection, DequeueOptions, QueueCreator, QueuePurger, TransactionOptions,
    VisibilityMode,
};
use crate::error::{TransportError, DEADLOCK_DETECTED, QUEUE_DOES_NOT_EXIST};
use crate::message::{Address, RawMessage};
use crate::naming::{qualify, DefaultQueueNamePolicy, QueueNamePolicy};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Broker code for a session whose network link dropped.
const END_OF_FILE_ON_CHANNEL: i32 = 3113;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Configuration and Statistics
// ============================================================================

/// Configuration for the in-memory broker
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfig {
    /// Schema used to qualify queues created through [`QueueCreator`]
    pub schema: Option<String>,
}

/// Counters describing broker activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub enqueued: u64,
    pub dequeued: u64,
}

impl BrokerStats {
    /// Connections opened and not yet closed
    pub fn open_connections(&self) -> u64 {
        self.connections_opened - self.connections_closed
    }
}

/// Failures to inject into upcoming calls
#[derive(Debug, Default)]
struct FaultPlan {
    connect: u32,
    listen: u32,
    dequeue: u32,
    commit: u32,
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<RawMessage>>,
    stats: BrokerStats,
    faults: FaultPlan,
    client_infos: Vec<String>,
}

impl BrokerState {
    fn queue_mut(&mut self, queue_name: &str) -> Result<&mut VecDeque<RawMessage>, TransportError> {
        self.queues
            .get_mut(queue_name)
            .ok_or_else(|| queue_missing(queue_name))
    }

    /// Put rolled-back dequeues back at the head, oldest first
    fn restore(&mut self, transaction: PendingTransaction) {
        for (queue_name, message) in transaction.dequeued.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.push_front(message);
            }
        }
        self.stats.rollbacks += 1;
    }
}

fn queue_missing(queue_name: &str) -> TransportError {
    TransportError::broker(
        QUEUE_DOES_NOT_EXIST,
        format!("queue {} does not exist", queue_name),
    )
}

struct Shared {
    state: Mutex<BrokerState>,
    arrivals: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Work recorded by an open transaction
struct PendingTransaction {
    started: Instant,
    timeout: Duration,
    dequeued: Vec<(String, RawMessage)>,
    enqueued: Vec<(String, RawMessage)>,
}

// ============================================================================
// Broker
// ============================================================================

/// In-memory broker; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    naming: Arc<dyn QueueNamePolicy>,
    config: InMemoryConfig,
}

impl InMemoryBroker {
    /// Create new in-memory broker with default configuration
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
            }),
            naming: Arc::new(DefaultQueueNamePolicy),
            config,
        }
    }

    /// Use a different policy for queues created through [`QueueCreator`]
    pub fn with_naming_policy(mut self, naming: Arc<dyn QueueNamePolicy>) -> Self {
        self.naming = naming;
        self
    }

    /// Create a queue by its broker name; existing queues are left alone
    pub fn create_queue(&self, queue_name: &str) {
        self.shared
            .state()
            .queues
            .entry(queue_name.to_string())
            .or_default();
    }

    /// Enqueue a payload outside any transaction, returning its message id
    pub fn enqueue_raw(
        &self,
        queue_name: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Vec<u8>, TransportError> {
        let message = assign_id(RawMessage::new(payload, None));
        let id = message.message_id.clone();
        {
            let mut state = self.shared.state();
            state.queue_mut(queue_name)?.push_back(message);
            state.stats.enqueued += 1;
        }
        self.shared.arrivals.notify_waiters();
        Ok(id)
    }

    /// Messages currently visible in a queue
    pub fn depth(&self, queue_name: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    /// Copy of the visible messages in a queue, head first
    pub fn messages(&self, queue_name: &str) -> Vec<RawMessage> {
        self.shared
            .state()
            .queues
            .get(queue_name)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.state().stats.clone()
    }

    /// Client tags set by connections, in order
    pub fn client_infos(&self) -> Vec<String> {
        self.shared.state().client_infos.clone()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.shared.state().faults.connect = count;
    }

    pub fn fail_next_listens(&self, count: u32) {
        self.shared.state().faults.listen = count;
    }

    pub fn fail_next_dequeues(&self, count: u32) {
        self.shared.state().faults.dequeue = count;
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.shared.state().faults.commit = count;
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn assign_id(message: RawMessage) -> RawMessage {
    if message.message_id.is_empty() {
        message.with_message_id(uuid::Uuid::new_v4().to_bytes_le().to_vec())
    } else {
        message
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(
        &self,
        connection_string: &str,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        {
            let mut state = self.shared.state();
            if take_fault(&mut state.faults.connect) {
                return Err(TransportError::ConnectionFailed {
                    message: "TNS: listener could not be reached".to_string(),
                });
            }
            state.stats.connections_opened += 1;
        }

        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            connection_string: connection_string.to_string(),
            listening: None,
            transaction: None,
            closed: false,
        }))
    }
}

#[async_trait]
impl QueueCreator for InMemoryBroker {
    async fn create_queue_if_absent(&self, address: &Address) -> Result<(), TransportError> {
        let schema = address.scope().or(self.config.schema.as_deref());
        let queue_name = qualify(schema, &self.naming.queue_name(address));
        debug!(queue = %queue_name, "Creating queue if absent");
        self.create_queue(&queue_name);
        Ok(())
    }
}

#[async_trait]
impl QueuePurger for InMemoryBroker {
    async fn purge(&self, queue_name: &str) -> Result<u64, TransportError> {
        let mut state = self.shared.state();
        let queue = state.queue_mut(queue_name)?;
        let removed = queue.len() as u64;
        queue.clear();
        Ok(removed)
    }
}

// ============================================================================
// Connection
// ============================================================================

struct InMemoryConnection {
    shared: Arc<Shared>,
    connection_string: String,
    listening: Option<String>,
    transaction: Option<PendingTransaction>,
    closed: bool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionFailed {
                message: "connection is closed".to_string(),
            });
        }
        Ok(())
    }

    fn rollback_pending(&mut self) -> bool {
        match self.transaction.take() {
            Some(transaction) => {
                self.shared.state().restore(transaction);
                self.shared.arrivals.notify_waiters();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    async fn set_client_info(&mut self, client_info: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shared.state().client_infos.push(client_info.to_string());
        Ok(())
    }

    async fn listen(&mut self, queue_name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        {
            let mut state = self.shared.state();
            if take_fault(&mut state.faults.listen) {
                return Err(TransportError::broker(
                    END_OF_FILE_ON_CHANNEL,
                    "end-of-file on communication channel",
                ));
            }
            state.queue_mut(queue_name)?;
        }
        self.listening = Some(queue_name.to_string());
        Ok(())
    }

    async fn dequeue(
        &mut self,
        queue_name: &str,
        options: &DequeueOptions,
    ) -> Result<RawMessage, TransportError> {
        self.ensure_open()?;
        let deadline = Instant::now() + options.wait;

        loop {
            // Registered before the check so an arrival in between is not missed
            let arrival = self.shared.arrivals.notified();
            {
                let mut state = self.shared.state();
                if take_fault(&mut state.faults.dequeue) {
                    return Err(TransportError::broker(
                        END_OF_FILE_ON_CHANNEL,
                        "end-of-file on communication channel",
                    ));
                }
                if let Some(message) = state.queue_mut(queue_name)?.pop_front() {
                    state.stats.dequeued += 1;
                    if let Some(transaction) = self.transaction.as_mut() {
                        transaction
                            .dequeued
                            .push((queue_name.to_string(), message.clone()));
                    }
                    return Ok(message);
                }
            }

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Err(TransportError::no_message());
            }
        }
    }

    async fn enqueue(
        &mut self,
        queue_name: &str,
        message: RawMessage,
        visibility: VisibilityMode,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let message = assign_id(message);

        let deferred = match (visibility, self.transaction.as_mut()) {
            (VisibilityMode::OnCommit, Some(transaction)) => Some(transaction),
            _ => None,
        };

        let mut state = self.shared.state();
        state.queue_mut(queue_name)?;
        match deferred {
            Some(transaction) => {
                transaction.enqueued.push((queue_name.to_string(), message));
            }
            None => {
                state.queue_mut(queue_name)?.push_back(message);
                state.stats.enqueued += 1;
                drop(state);
                self.shared.arrivals.notify_waiters();
            }
        }
        Ok(())
    }

    async fn begin_transaction(
        &mut self,
        options: &TransactionOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.transaction.is_some() {
            return Err(TransportError::Transaction {
                message: "a transaction is already active on this connection".to_string(),
            });
        }
        self.transaction = Some(PendingTransaction {
            started: Instant::now(),
            timeout: options.timeout,
            dequeued: Vec::new(),
            enqueued: Vec::new(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Some(transaction) = self.transaction.take() else {
            return Ok(());
        };

        let mut state = self.shared.state();
        if transaction.started.elapsed() > transaction.timeout {
            let timeout = transaction.timeout;
            state.restore(transaction);
            drop(state);
            self.shared.arrivals.notify_waiters();
            return Err(TransportError::Transaction {
                message: format!("transaction exceeded its timeout of {:?}", timeout),
            });
        }
        if take_fault(&mut state.faults.commit) {
            state.restore(transaction);
            drop(state);
            self.shared.arrivals.notify_waiters();
            return Err(TransportError::broker(
                DEADLOCK_DETECTED,
                "deadlock detected while waiting for resource",
            ));
        }

        let mut visible = 0;
        for (queue_name, message) in transaction.enqueued {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.push_back(message);
                visible += 1;
            }
        }
        state.stats.enqueued += visible;
        state.stats.commits += 1;
        drop(state);
        self.shared.arrivals.notify_waiters();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.rollback_pending();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        if self.rollback_pending() {
            debug!(
                queue = self.listening.as_deref().unwrap_or(""),
                "Rolled back open transaction on close"
            );
        }
        self.closed = true;
        self.listening = None;
        self.shared.state().stats.connections_closed += 1;
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.rollback_pending();
            self.closed = true;
            self.shared.state().stats.connections_closed += 1;
        }
    }
}
