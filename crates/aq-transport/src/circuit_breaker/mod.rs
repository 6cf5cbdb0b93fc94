//! Circuit breaker guarding the receive loops against sustained broker outages.
//!
//! Unlike a request-gating breaker this one never rejects work. It watches
//! the failures that escape receive cycles (connect, listen, dequeue, commit)
//! and decides how long the failing loop backs off before it restarts.
//!
//! # Circuit Breaker States
//!
//! - **Closed**: No unresolved failures
//! - **Armed**: Failures are occurring but have not lasted long enough to
//!   signal an outage; loops back off briefly between retries
//! - **Tripped**: Failures have persisted past the configured threshold; the
//!   critical-error notifier has been called once and loops cool down for
//!   longer between retries
//!
//! Any successful cycle returns the breaker to **Closed**.
//!
//! # Example
//!
//! ```rust
//! use aq_transport::circuit_breaker::{
//!     CircuitBreaker, CircuitBreakerConfig, CircuitState, DefaultCircuitBreaker,
//!     LoggingCriticalErrorNotifier,
//! };
//! use std::sync::Arc;
//!
//! let breaker = DefaultCircuitBreaker::new(
//!     CircuitBreakerConfig::for_queue("SALES.ORDERS"),
//!     Arc::new(LoggingCriticalErrorNotifier),
//! );
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::error;

use crate::error::TransportError;

mod breaker;
pub use breaker::DefaultCircuitBreaker;

// ============================================================================
// Circuit Breaker Trait
// ============================================================================

/// Failure tracking shared by all polling loops of one queue.
///
/// Implementations must tolerate concurrent calls from every loop.
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Record a successful cycle, clearing any failure run.
    fn success(&self);

    /// Record a failed cycle.
    ///
    /// Notifies the critical-error sink when the failure run first outlasts
    /// the trigger threshold, then waits out the back-off appropriate to the
    /// current state before returning.
    async fn failure(&self, error: &TransportError);

    /// Get current circuit breaker state.
    fn state(&self) -> CircuitState;

    /// Get circuit breaker metrics.
    fn metrics(&self) -> CircuitMetrics;

    /// Stop notifying and backing off. Called when the engine stops.
    fn dispose(&self);
}

// ============================================================================
// Critical Error Notification
// ============================================================================

/// Receives the once-per-trip notification that a queue is unreachable.
pub trait CriticalErrorNotifier: Send + Sync {
    fn raise_critical_error(&self, description: &str, error: &TransportError);
}

impl<F> CriticalErrorNotifier for F
where
    F: Fn(&str, &TransportError) + Send + Sync,
{
    fn raise_critical_error(&self, description: &str, error: &TransportError) {
        self(description, error)
    }
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCriticalErrorNotifier;

impl CriticalErrorNotifier for LoggingCriticalErrorNotifier {
    fn raise_critical_error(&self, description: &str, error: &TransportError) {
        error!(error = %error, "Critical error: {}", description);
    }
}

// ============================================================================
// Circuit State
// ============================================================================

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Armed,
    Tripped,
}

impl CircuitState {
    /// Check if circuit has unresolved failures.
    pub fn is_failure_state(&self) -> bool {
        matches!(self, Self::Armed | Self::Tripped)
    }
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Configuration for circuit breaker behavior.
///
/// # Default Configuration
///
/// - Trigger threshold: 30 seconds of uninterrupted failures
/// - Delay after a failure: 1 second
/// - Cool-down once tripped: 10 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Name used in logs and in the critical-error description.
    pub name: String,

    /// How long failures must persist before the breaker trips.
    pub time_to_wait_before_triggering: Duration,

    /// Back-off after a failure while the breaker is armed.
    pub delay_after_failure: Duration,

    /// Back-off after a failure while the breaker is tripped.
    pub cool_down: Duration,
}

impl CircuitBreakerConfig {
    /// Default timings, named after the queue being guarded
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            name: queue_name.into(),
            ..Self::default()
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            time_to_wait_before_triggering: Duration::from_secs(30),
            delay_after_failure: Duration::from_secs(1),
            cool_down: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Circuit Metrics
// ============================================================================

/// Metrics and statistics for circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    /// Current circuit state.
    pub state: CircuitState,

    /// Failures since the last success.
    pub consecutive_failures: u64,

    /// Failures over the breaker's lifetime.
    pub total_failures: u64,

    /// Number of times the breaker has tripped.
    pub trips: u64,

    /// When the current failure run started.
    pub armed_at: Option<DateTime<Utc>>,

    pub last_failure_at: Option<DateTime<Utc>>,

    pub last_trip_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
