//! Tests for the transactional receive strategy.

use super::*;
use crate::codec;
use crate::connection::ConnectionParams;
use crate::error::ProcessingError;
use crate::message::{SendOptions, TransportMessage};
use crate::providers::InMemoryBroker;
use crate::receive::processor_fn;
use bytes::Bytes;
use std::time::Duration;

const WORK_QUEUE: &str = "SALES.ORDERS";
const ERROR_QUEUE: &str = "SALES.ERROR";
const AUDIT_QUEUE: &str = "SALES.AUDIT";

fn setup() -> (InMemoryBroker, Transport) {
    let broker = InMemoryBroker::new();
    broker.create_queue(WORK_QUEUE);
    broker.create_queue(ERROR_QUEUE);
    broker.create_queue(AUDIT_QUEUE);
    let params = ConnectionParams::new(None, None, "Data Source=mem", Some("SALES")).unwrap();
    let transport = Transport::new(Arc::new(broker.clone()), params)
        .with_receive_wait(Duration::from_millis(20));
    (broker, transport)
}

fn strategy(
    transport: &Transport,
    processor: Arc<dyn MessageProcessor>,
) -> TransactionalReceiveStrategy {
    TransactionalReceiveStrategy::new(
        transport.clone(),
        &"error".parse().unwrap(),
        TransactionOptions::default(),
        processor,
    )
}

fn enqueue_work(broker: &InMemoryBroker, body: &'static [u8]) {
    let payload = codec::encode(
        &TransportMessage::new(Bytes::from_static(body)),
        &SendOptions::default(),
    )
    .unwrap();
    broker.enqueue_raw(WORK_QUEUE, payload).unwrap();
}

fn work_handle(transport: &Transport) -> QueueHandle {
    transport.queue_handle(&"orders".parse().unwrap())
}

/// Sends an audit record through the storage context, then answers as told
struct AuditingProcessor {
    outcome: fn() -> Result<bool, ProcessingError>,
}

#[async_trait]
impl MessageProcessor for AuditingProcessor {
    async fn process(
        &self,
        message: &mut TransportMessage,
        context: &mut StorageContext<'_>,
    ) -> Result<bool, ProcessingError> {
        let audit = TransportMessage::new(message.body.clone());
        context
            .send(&audit, &"audit".parse().unwrap(), &SendOptions::default())
            .await?;
        (self.outcome)()
    }
}

mod outcome_tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_queue_reports_no_message() {
        let (broker, transport) = setup();
        let strategy = strategy(&transport, Arc::new(processor_fn(|_| Ok(true))));
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await.unwrap();

        assert!(matches!(result, ReceiveResult::NoMessage));
        assert!(!handle.is_open());
        assert_eq!(broker.stats().open_connections(), 0);
    }

    /// Verify a successful processor commits the dequeue
    #[tokio::test]
    async fn test_success_commits() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        let strategy = strategy(&transport, Arc::new(processor_fn(|_| Ok(true))));
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await.unwrap();

        match result {
            ReceiveResult::Received(message) => {
                assert_eq!(message.body, Bytes::from_static(b"order-1"))
            }
            other => panic!("expected a received message, got {:?}", other.message()),
        }
        assert_eq!(broker.depth(WORK_QUEUE), 0);
        assert_eq!(broker.stats().commits, 1);
        assert_eq!(broker.stats().open_connections(), 0);
    }

    /// Verify a failing processor rolls the message back onto the queue
    #[tokio::test]
    async fn test_processor_error_rolls_back() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        let strategy = strategy(
            &transport,
            Arc::new(processor_fn(|_| Err("inventory service unavailable".into()))),
        );
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await.unwrap();

        match result {
            ReceiveResult::FailedProcessing { error, .. } => {
                assert_eq!(error.to_string(), "inventory service unavailable")
            }
            _ => panic!("expected a processing failure"),
        }
        assert_eq!(broker.depth(WORK_QUEUE), 1);
        assert_eq!(broker.stats().commits, 0);
    }

    /// Verify a declined message is reported but not committed
    #[tokio::test]
    async fn test_declined_message_is_redelivered() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        let strategy = strategy(&transport, Arc::new(processor_fn(|_| Ok(false))));
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await.unwrap();

        assert!(matches!(result, ReceiveResult::Received(_)));
        assert_eq!(broker.depth(WORK_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_processor_panic_becomes_failure() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        let strategy = strategy(
            &transport,
            Arc::new(processor_fn(|_| panic!("handler bug"))),
        );
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await.unwrap();

        match result {
            ReceiveResult::FailedProcessing { error, .. } => {
                assert!(error.to_string().contains("handler bug"))
            }
            _ => panic!("expected a processing failure"),
        }
        assert_eq!(broker.depth(WORK_QUEUE), 1);
        assert_eq!(broker.stats().open_connections(), 0);
    }

    /// Verify a commit conflict after processing is reported as a failure
    #[tokio::test]
    async fn test_commit_failure_becomes_failure() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        broker.fail_next_commits(1);
        let strategy = strategy(&transport, Arc::new(processor_fn(|_| Ok(true))));
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await.unwrap();

        match result {
            ReceiveResult::FailedProcessing { error, .. } => {
                assert!(error.to_string().contains("ORA-00060"))
            }
            _ => panic!("expected a processing failure"),
        }
        assert_eq!(broker.depth(WORK_QUEUE), 1);
    }
}

mod poison_tests {
    use super::*;

    /// Verify undecodable payloads move to the error queue byte for byte
    #[tokio::test]
    async fn test_poison_forwarded_and_committed() {
        let (broker, transport) = setup();
        broker
            .enqueue_raw(WORK_QUEUE, Bytes::from_static(b"<not-a-transport-message/>"))
            .unwrap();
        let strategy = strategy(
            &transport,
            Arc::new(processor_fn(|_| panic!("processor must not see poison"))),
        );
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await.unwrap();

        assert!(matches!(result, ReceiveResult::NoMessage));
        assert_eq!(broker.depth(WORK_QUEUE), 0);
        let forwarded = broker.messages(ERROR_QUEUE);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(
            forwarded[0].payload,
            Bytes::from_static(b"<not-a-transport-message/>")
        );
    }

    /// Verify a failed forward leaves the poison message on the work queue
    #[tokio::test]
    async fn test_poison_forward_failure_rolls_back() {
        let broker = InMemoryBroker::new();
        broker.create_queue(WORK_QUEUE);
        let params = ConnectionParams::new(None, None, "Data Source=mem", Some("SALES")).unwrap();
        let transport = Transport::new(Arc::new(broker.clone()), params)
            .with_receive_wait(Duration::from_millis(20));
        broker.enqueue_raw(WORK_QUEUE, Bytes::from_static(b"garbage")).unwrap();
        let strategy = strategy(&transport, Arc::new(processor_fn(|_| Ok(true))));
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await;

        assert!(result.is_err());
        assert_eq!(broker.depth(WORK_QUEUE), 1);
        assert_eq!(broker.stats().open_connections(), 0);
    }
}

mod storage_context_tests {
    use super::*;

    /// Verify sends made while processing become visible with the commit
    #[tokio::test]
    async fn test_context_sends_commit_with_cycle() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        let strategy = strategy(
            &transport,
            Arc::new(AuditingProcessor {
                outcome: || Ok(true),
            }),
        );
        let mut handle = work_handle(&transport);

        strategy.try_receive_from(&mut handle).await.unwrap();

        assert_eq!(broker.depth(AUDIT_QUEUE), 1);
        assert_eq!(broker.depth(WORK_QUEUE), 0);
    }

    /// Verify sends made while processing vanish when processing fails
    #[tokio::test]
    async fn test_context_sends_roll_back_with_cycle() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        let strategy = strategy(
            &transport,
            Arc::new(AuditingProcessor {
                outcome: || Err("downstream rejected".into()),
            }),
        );
        let mut handle = work_handle(&transport);

        strategy.try_receive_from(&mut handle).await.unwrap();

        assert_eq!(broker.depth(AUDIT_QUEUE), 0);
        assert_eq!(broker.depth(WORK_QUEUE), 1);
    }
}

mod connectivity_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let (broker, transport) = setup();
        broker.fail_next_connects(1);
        let strategy = strategy(&transport, Arc::new(processor_fn(|_| Ok(true))));
        let mut handle = work_handle(&transport);

        let result = strategy.try_receive_from(&mut handle).await;

        assert!(result.is_err());
        assert!(!handle.is_open());
        assert_eq!(broker.stats().open_connections(), 0);
    }

    /// Verify a dequeue failure rolls back and releases the handle
    #[tokio::test]
    async fn test_dequeue_failure_releases_handle() {
        let (broker, transport) = setup();
        enqueue_work(&broker, b"order-1");
        broker.fail_next_dequeues(1);
        let strategy = strategy(&transport, Arc::new(processor_fn(|_| Ok(true))));
        let mut handle = work_handle(&transport);

        let error = strategy.try_receive_from(&mut handle).await.unwrap_err();

        assert!(error.is_transient());
        assert!(!handle.is_open());
        assert_eq!(broker.depth(WORK_QUEUE), 1);
        assert_eq!(broker.stats().open_connections(), 0);
    }
}
