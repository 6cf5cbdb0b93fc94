//! Common test utilities for aq-transport integration tests
//!
//! This module provides:
//! - Recording implementations of the host seams (processor, completion
//!   handler, critical error notifier)
//! - A broker fixture with the queues used across the suites
//! - Helpers for building envelopes and waiting on asynchronous outcomes

use aq_transport::codec;
use aq_transport::{
    Address, CompletionHandler, ConnectionParams, CriticalErrorNotifier, InMemoryBroker,
    MessageProcessor, ProcessingError, SendOptions, StorageContext, Transport, TransportError,
    TransportMessage,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WORK_QUEUE: &str = "SALES.ORDERS";
pub const ERROR_QUEUE: &str = "SALES.ERROR";
pub const REPLY_QUEUE: &str = "SALES.REPLIES";

// ============================================================================
// Broker Fixture
// ============================================================================

/// Broker with the work, error and reply queues of the SALES schema
pub fn sales_broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_queue(WORK_QUEUE);
    broker.create_queue(ERROR_QUEUE);
    broker.create_queue(REPLY_QUEUE);
    broker
}

/// Transport over the broker with a short receive wait
pub fn sales_transport(broker: &InMemoryBroker) -> Transport {
    let params = ConnectionParams::new(None, None, "Data Source=mem", Some("SALES"))
        .expect("valid connection params");
    Transport::new(Arc::new(broker.clone()), params).with_receive_wait(Duration::from_millis(20))
}

pub fn address(text: &str) -> Address {
    text.parse().expect("valid address")
}

/// Encode a work item and put it on the work queue
pub fn enqueue_work(broker: &InMemoryBroker, message: &TransportMessage) {
    let payload = codec::encode(message, &SendOptions::default()).expect("encodable message");
    broker
        .enqueue_raw(WORK_QUEUE, payload)
        .expect("work queue exists");
}

/// Poll a condition until it holds or two seconds pass
#[allow(dead_code)]
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ============================================================================
// Recording Processor
// ============================================================================

/// What the recording processor answers after it has replied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Outcome {
    Handled,
    Declined,
    Fail,
}

/// Records every work item and sends a reply through the storage context.
///
/// Replies go to the item's reply-to address when it has one.
#[derive(Clone)]
pub struct RecordingProcessor {
    outcome: Outcome,
    seen: Arc<Mutex<Vec<TransportMessage>>>,
}

impl RecordingProcessor {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[allow(dead_code)]
    pub fn seen(&self) -> Vec<TransportMessage> {
        self.seen.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    async fn process(
        &self,
        message: &mut TransportMessage,
        context: &mut StorageContext<'_>,
    ) -> Result<bool, ProcessingError> {
        self.seen.lock().unwrap().push(message.clone());

        if let Some(reply_to) = message.reply_to_address.clone() {
            let reply = TransportMessage::new(message.body.clone())
                .with_correlation_id(message.id.clone());
            context
                .send(&reply, &reply_to, &SendOptions::default())
                .await?;
        }

        match self.outcome {
            Outcome::Handled => Ok(true),
            Outcome::Declined => Ok(false),
            Outcome::Fail => Err("order rejected by host".into()),
        }
    }
}

// ============================================================================
// Recording Completion Handler
// ============================================================================

#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingCompletion {
    completed: Mutex<Vec<(Bytes, Option<String>)>>,
}

#[allow(dead_code)]
impl RecordingCompletion {
    pub fn count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<Bytes> {
        self.completed
            .lock()
            .unwrap()
            .iter()
            .map(|(body, _)| body.clone())
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.completed
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, error)| error.is_some())
            .count()
    }
}

#[async_trait]
impl CompletionHandler for RecordingCompletion {
    async fn on_message_completed(
        &self,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) {
        self.completed
            .lock()
            .unwrap()
            .push((message.body.clone(), error.map(|e| e.to_string())));
    }
}

// ============================================================================
// Recording Notifier
// ============================================================================

#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingNotifier {
    raised: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn raised(&self) -> Vec<String> {
        self.raised.lock().unwrap().clone()
    }
}

impl CriticalErrorNotifier for RecordingNotifier {
    fn raise_critical_error(&self, message: &str, error: &TransportError) {
        self.raised
            .lock()
            .unwrap()
            .push(format!("{}: {}", message, error));
    }
}
