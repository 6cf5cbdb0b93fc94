//! Tests for the shared transport context.

use super::*;
use crate::providers::InMemoryBroker;

fn transport(schema: Option<&str>) -> Transport {
    let params = ConnectionParams::new(None, None, "Data Source=mem", schema).unwrap();
    Transport::new(Arc::new(InMemoryBroker::new()), params)
}

/// Custom policy that keeps queue names as written
struct VerbatimPolicy;

impl QueueNamePolicy for VerbatimPolicy {
    fn queue_name(&self, address: &Address) -> String {
        address.queue().to_string()
    }

    fn queue_table_name(&self, address: &Address) -> String {
        format!("{}_table", address.queue())
    }
}

#[test]
fn test_queue_name_uses_configured_schema() {
    let name = transport(Some("SALES")).queue_name(&"sales.orders".parse().unwrap());

    assert_eq!(name, "SALES.SALES_ORDERS");
}

/// Verify an address scope names the schema over the configured one
#[test]
fn test_address_scope_wins() {
    let name = transport(Some("SALES")).queue_name(&"orders@BILLING".parse().unwrap());

    assert_eq!(name, "BILLING.ORDERS");
}

#[test]
fn test_queue_name_without_schema() {
    assert_eq!(transport(None).queue_name(&"orders".parse().unwrap()), "ORDERS");
}

#[test]
fn test_custom_naming_policy() {
    let transport = transport(Some("SALES")).with_naming_policy(Arc::new(VerbatimPolicy));

    assert_eq!(transport.queue_name(&"orders".parse().unwrap()), "SALES.orders");
}

/// Verify handles inherit the receive wait and start closed
#[test]
fn test_queue_handle_is_closed() {
    let transport = transport(Some("SALES")).with_receive_wait(Duration::from_millis(5));

    let handle = transport.queue_handle(&"orders".parse().unwrap());

    assert_eq!(handle.queue_name(), "SALES.ORDERS");
    assert!(!handle.is_open());
}

/// Verify clones with other connection params share the enlistment cache
#[test]
fn test_with_connection_params_shares_caches() {
    let base = transport(Some("SALES"));
    let other = base.with_connection_params(
        ConnectionParams::new(None, None, "Data Source=other", Some("AUDIT")).unwrap(),
    );

    assert!(Arc::ptr_eq(base.enlistment(), other.enlistment()));
    assert_eq!(other.connection_params().schema(), Some("AUDIT"));
    assert_eq!(base.connection_params().schema(), Some("SALES"));
}
