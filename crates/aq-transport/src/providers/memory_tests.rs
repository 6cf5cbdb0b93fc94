//! Tests for the in-memory broker.

use super::*;
use crate::broker::IsolationLevel;

const QUEUE: &str = "SALES.ORDERS";

fn broker_with_queue() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_queue(QUEUE);
    broker
}

fn short_wait() -> DequeueOptions {
    DequeueOptions {
        wait: Duration::from_millis(50),
    }
}

fn transaction(timeout: Duration) -> TransactionOptions {
    TransactionOptions {
        isolation_level: IsolationLevel::ReadCommitted,
        timeout,
    }
}

mod dequeue_tests {
    use super::*;

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let broker = broker_with_queue();
        broker.enqueue_raw(QUEUE, "first").unwrap();
        broker.enqueue_raw(QUEUE, "second").unwrap();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        let first = connection.dequeue(QUEUE, &short_wait()).await.unwrap();
        let second = connection.dequeue(QUEUE, &short_wait()).await.unwrap();

        assert_eq!(first.payload, Bytes::from_static(b"first"));
        assert_eq!(second.payload, Bytes::from_static(b"second"));
        assert_eq!(first.message_id.len(), 16);
    }

    /// Verify an empty queue reports end-of-fetch after the wait
    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_reports_no_message() {
        let broker = broker_with_queue();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        let error = connection
            .dequeue(QUEUE, &DequeueOptions { wait: Duration::from_secs(5) })
            .await
            .unwrap_err();

        assert!(error.is_no_message());
    }

    /// Verify a waiting dequeue wakes when a message arrives
    #[tokio::test]
    async fn test_waiting_dequeue_wakes_on_arrival() {
        let broker = broker_with_queue();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue_raw(QUEUE, "late").unwrap();
        });

        let message = connection
            .dequeue(QUEUE, &DequeueOptions { wait: Duration::from_secs(5) })
            .await
            .unwrap();

        assert_eq!(message.payload, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_unknown_queue_is_error() {
        let broker = InMemoryBroker::new();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        let error = connection.dequeue("MISSING", &short_wait()).await.unwrap_err();

        assert!(!error.is_no_message());
        assert!(!error.is_transient());
    }
}

mod transaction_tests {
    use super::*;

    /// Verify rollback puts dequeued messages back at the head in order
    #[tokio::test]
    async fn test_rollback_restores_dequeued_messages() {
        let broker = broker_with_queue();
        broker.enqueue_raw(QUEUE, "a").unwrap();
        broker.enqueue_raw(QUEUE, "b").unwrap();
        broker.enqueue_raw(QUEUE, "c").unwrap();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        connection
            .begin_transaction(&transaction(Duration::from_secs(30)))
            .await
            .unwrap();
        connection.dequeue(QUEUE, &short_wait()).await.unwrap();
        connection.dequeue(QUEUE, &short_wait()).await.unwrap();
        connection.rollback().await.unwrap();

        let payloads: Vec<Bytes> = broker.messages(QUEUE).into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec!["a", "b", "c"]);
        assert_eq!(broker.stats().rollbacks, 1);
    }

    /// Verify deferred enqueues stay invisible until commit
    #[tokio::test]
    async fn test_on_commit_enqueue_visible_after_commit() {
        let broker = broker_with_queue();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        connection
            .begin_transaction(&transaction(Duration::from_secs(30)))
            .await
            .unwrap();
        connection
            .enqueue(QUEUE, RawMessage::new("x", None), VisibilityMode::OnCommit)
            .await
            .unwrap();
        assert_eq!(broker.depth(QUEUE), 0);

        connection.commit().await.unwrap();
        assert_eq!(broker.depth(QUEUE), 1);
    }

    /// Verify immediate enqueues survive a rollback
    #[tokio::test]
    async fn test_immediate_enqueue_ignores_rollback() {
        let broker = broker_with_queue();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        connection
            .begin_transaction(&transaction(Duration::from_secs(30)))
            .await
            .unwrap();
        connection
            .enqueue(QUEUE, RawMessage::new("x", None), VisibilityMode::Immediate)
            .await
            .unwrap();
        connection.rollback().await.unwrap();

        assert_eq!(broker.depth(QUEUE), 1);
    }

    /// Verify a transaction older than its timeout cannot commit
    #[tokio::test(start_paused = true)]
    async fn test_commit_after_timeout_rolls_back() {
        let broker = broker_with_queue();
        broker.enqueue_raw(QUEUE, "a").unwrap();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        connection
            .begin_transaction(&transaction(Duration::from_secs(1)))
            .await
            .unwrap();
        connection.dequeue(QUEUE, &short_wait()).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let error = connection.commit().await.unwrap_err();

        assert!(matches!(error, TransportError::Transaction { .. }));
        assert_eq!(broker.depth(QUEUE), 1);
        assert!(!connection.in_transaction());
    }

    #[tokio::test]
    async fn test_injected_commit_failure_rolls_back() {
        let broker = broker_with_queue();
        broker.enqueue_raw(QUEUE, "a").unwrap();
        broker.fail_next_commits(1);
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        connection
            .begin_transaction(&transaction(Duration::from_secs(30)))
            .await
            .unwrap();
        connection.dequeue(QUEUE, &short_wait()).await.unwrap();
        let error = connection.commit().await.unwrap_err();

        assert!(matches!(error, TransportError::Broker { code: DEADLOCK_DETECTED, .. }));
        assert_eq!(broker.depth(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_nested_begin_rejected() {
        let broker = broker_with_queue();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();
        let options = transaction(Duration::from_secs(30));

        connection.begin_transaction(&options).await.unwrap();
        assert!(connection.begin_transaction(&options).await.is_err());
    }
}

mod lifecycle_tests {
    use super::*;

    /// Verify closing with an open transaction rolls it back
    #[tokio::test]
    async fn test_close_rolls_back_open_transaction() {
        let broker = broker_with_queue();
        broker.enqueue_raw(QUEUE, "a").unwrap();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        connection
            .begin_transaction(&transaction(Duration::from_secs(30)))
            .await
            .unwrap();
        connection.dequeue(QUEUE, &short_wait()).await.unwrap();
        connection.close().await.unwrap();
        connection.close().await.unwrap();

        assert_eq!(broker.depth(QUEUE), 1);
        let stats = broker.stats();
        assert_eq!(stats.connections_closed, 1);
        assert_eq!(stats.open_connections(), 0);
    }

    /// Verify dropping an unclosed connection releases it
    #[tokio::test]
    async fn test_drop_releases_connection() {
        let broker = broker_with_queue();
        broker.enqueue_raw(QUEUE, "a").unwrap();
        {
            let mut connection = broker.connect("Data Source=mem").await.unwrap();
            connection
                .begin_transaction(&transaction(Duration::from_secs(30)))
                .await
                .unwrap();
            connection.dequeue(QUEUE, &short_wait()).await.unwrap();
        }

        assert_eq!(broker.depth(QUEUE), 1);
        assert_eq!(broker.stats().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let broker = broker_with_queue();
        broker.fail_next_connects(1);

        assert!(broker.connect("Data Source=mem").await.is_err());
        assert!(broker.connect("Data Source=mem").await.is_ok());
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn test_client_info_recorded() {
        let broker = broker_with_queue();
        let mut connection = broker.connect("Data Source=mem").await.unwrap();

        connection.set_client_info("worker 1").await.unwrap();

        assert_eq!(broker.client_infos(), vec!["worker 1".to_string()]);
    }
}

mod admin_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_queue_uses_naming_policy_and_schema() {
        let broker = InMemoryBroker::with_config(InMemoryConfig {
            schema: Some("SALES".to_string()),
        });

        broker
            .create_queue_if_absent(&"orders.v2".parse().unwrap())
            .await
            .unwrap();

        assert!(broker.enqueue_raw("SALES.ORDERS_V2", "x").is_ok());
    }

    #[tokio::test]
    async fn test_purge_removes_all_messages() {
        let broker = broker_with_queue();
        broker.enqueue_raw(QUEUE, "a").unwrap();
        broker.enqueue_raw(QUEUE, "b").unwrap();

        let removed = broker.purge(QUEUE).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(broker.depth(QUEUE), 0);
        assert!(broker.purge("MISSING").await.is_err());
    }
}
