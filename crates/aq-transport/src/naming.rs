//! Mapping from logical addresses to broker queue and queue-table names.

use crate::message::Address;

/// Maps an address to the names of its broker objects.
pub trait QueueNamePolicy: Send + Sync {
    /// Name of the queue object for the address
    fn queue_name(&self, address: &Address) -> String;

    /// Name of the table backing the queue
    fn queue_table_name(&self, address: &Address) -> String;
}

/// Upper-cases the queue name and replaces `.` with `_`; tables are `AQ_<NAME>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultQueueNamePolicy;

impl QueueNamePolicy for DefaultQueueNamePolicy {
    fn queue_name(&self, address: &Address) -> String {
        address.queue().replace('.', "_").to_uppercase()
    }

    fn queue_table_name(&self, address: &Address) -> String {
        format!("AQ_{}", self.queue_name(address))
    }
}

/// Prefix a broker object name with its schema, if any
pub fn qualify(schema: Option<&str>, name: &str) -> String {
    match schema.map(str::trim).filter(|s| !s.is_empty()) {
        Some(schema) => format!("{}.{}", schema, name),
        None => name.to_string(),
    }
}

#[cfg(test)]
#[path = "naming_tests.rs"]
mod tests;
