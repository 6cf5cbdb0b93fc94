//! Transaction scope for the transactional receive cycle.

use crate::broker::{BrokerConnection, TransactionOptions};
use crate::error::TransportError;
use tracing::warn;

/// A broker transaction opened on a connection for one receive cycle.
///
/// `complete` commits eagerly so that commit-time conflicts surface within
/// the cycle. `dispose` rolls back whatever was not completed.
#[derive(Debug)]
pub struct TransactionScope {
    completed: bool,
}

impl TransactionScope {
    /// Begin a transaction on the connection and enlist it in the scope
    pub async fn begin(
        connection: &mut dyn BrokerConnection,
        options: &TransactionOptions,
    ) -> Result<Self, TransportError> {
        connection.begin_transaction(options).await?;
        Ok(Self { completed: false })
    }

    /// Whether the scope committed
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Commit now.
    ///
    /// # Errors
    ///
    /// Propagates commit failures such as deadlocks or an elapsed timeout;
    /// the broker has rolled back by then.
    pub async fn complete(
        &mut self,
        connection: &mut dyn BrokerConnection,
    ) -> Result<(), TransportError> {
        connection.commit().await?;
        self.completed = true;
        Ok(())
    }

    /// End the scope, rolling back if it was not completed
    pub async fn dispose(self, connection: &mut dyn BrokerConnection) {
        if self.completed || !connection.in_transaction() {
            return;
        }
        if let Err(e) = connection.rollback().await {
            warn!(error = %e, "Rollback failed; the broker discards the transaction on close");
        }
    }
}

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;
