//! Default circuit breaker implementation.
//!
//! State lives behind a `Mutex` that is never held across an await, so loops
//! on dedicated threads and on the shared runtime can use the same instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState, CriticalErrorNotifier,
};
use crate::error::TransportError;

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug, Default)]
struct InternalState {
    consecutive_failures: u64,
    total_failures: u64,
    trips: u64,

    /// Monotonic start of the current failure run
    armed_at: Option<Instant>,

    armed_at_wall: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_trip_at: Option<DateTime<Utc>>,
    tripped: bool,
}

impl InternalState {
    fn state(&self) -> CircuitState {
        if self.tripped {
            CircuitState::Tripped
        } else if self.armed_at.is_some() {
            CircuitState::Armed
        } else {
            CircuitState::Closed
        }
    }
}

/// What a failure decided, acted on after the lock is released
struct FailureOutcome {
    trip: bool,
    first: bool,
    back_off: Duration,
}

// ============================================================================
// Default Circuit Breaker
// ============================================================================

/// Repeated-failures-over-time circuit breaker.
///
/// The first failure arms the breaker. A failure observed once the run has
/// lasted longer than `time_to_wait_before_triggering` trips it and calls
/// the notifier; later failures in the same run do not notify again.
pub struct DefaultCircuitBreaker {
    config: CircuitBreakerConfig,
    notifier: Arc<dyn CriticalErrorNotifier>,
    state: Mutex<InternalState>,
    disposed: AtomicBool,
}

impl DefaultCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, notifier: Arc<dyn CriticalErrorNotifier>) -> Self {
        Self {
            config,
            notifier,
            state: Mutex::new(InternalState::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, InternalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn record_failure(&self) -> FailureOutcome {
        let mut state = self.lock();
        let now = Instant::now();

        state.consecutive_failures += 1;
        state.total_failures += 1;
        state.last_failure_at = Some(Utc::now());

        let first = state.armed_at.is_none();
        if first {
            state.armed_at = Some(now);
            state.armed_at_wall = state.last_failure_at;
        }

        let run = state
            .armed_at
            .map_or(Duration::ZERO, |armed_at| now.duration_since(armed_at));
        let trip = !state.tripped && run > self.config.time_to_wait_before_triggering;
        if trip {
            state.tripped = true;
            state.trips += 1;
            state.last_trip_at = state.last_failure_at;
        }

        FailureOutcome {
            trip,
            first,
            back_off: if state.tripped {
                self.config.cool_down
            } else {
                self.config.delay_after_failure
            },
        }
    }
}

#[async_trait]
impl CircuitBreaker for DefaultCircuitBreaker {
    fn success(&self) {
        let mut state = self.lock();
        if state.armed_at.is_none() {
            return;
        }

        let failures = state.consecutive_failures;
        let was_tripped = state.tripped;
        state.consecutive_failures = 0;
        state.armed_at = None;
        state.armed_at_wall = None;
        state.tripped = false;
        drop(state);

        info!(
            breaker = %self.config.name,
            failures,
            was_tripped,
            "Circuit breaker disarmed"
        );
    }

    async fn failure(&self, error: &TransportError) {
        if self.is_disposed() {
            return;
        }

        let outcome = self.record_failure();

        if outcome.first {
            warn!(
                breaker = %self.config.name,
                error = %error,
                "Circuit breaker armed"
            );
        }

        if outcome.trip {
            let description = format!(
                "Receiving from '{}' has failed for longer than {:?}",
                self.config.name, self.config.time_to_wait_before_triggering
            );
            error!(
                breaker = %self.config.name,
                error = %error,
                "Circuit breaker tripped"
            );
            self.notifier.raise_critical_error(&description, error);
        }

        tokio::time::sleep(outcome.back_off).await;
    }

    fn state(&self) -> CircuitState {
        self.lock().state()
    }

    fn metrics(&self) -> CircuitMetrics {
        let state = self.lock();
        CircuitMetrics {
            state: state.state(),
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            trips: state.trips,
            armed_at: state.armed_at_wall,
            last_failure_at: state.last_failure_at,
            last_trip_at: state.last_trip_at,
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
