//! Broker implementations.

pub mod memory;

pub use memory::{BrokerStats, InMemoryBroker, InMemoryConfig};
