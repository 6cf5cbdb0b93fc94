//! Polling engine: a supervised pool of receive loops for one work queue.
//!
//! Each loop owns its own [`QueueHandle`] and repeatedly asks the receive
//! strategy for one cycle. Errors escaping a cycle go to the circuit breaker
//! and the loop restarts on a fresh handle; panics are caught and treated
//! the same way so a worker slot is never lost. Cancellation is checked at
//! the top of each cycle, so an in-flight receive finishes before a loop
//! exits.

use crate::broker::{Broker, QueuePurger};
use crate::circuit_breaker::{CircuitBreaker, CriticalErrorNotifier, DefaultCircuitBreaker};
use crate::config::TransportSettings;
use crate::error::{ConfigurationError, ProcessingError, TransportError};
use crate::message::{Address, ReceiveResult, TransportMessage};
use crate::queue_handle::QueueHandle;
use crate::receive::{panic_message, MessageProcessor, ReceiveStrategy, ReceiveStrategyFactory};
use crate::transport::Transport;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Default time `stop` waits for loops to drain
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Completion Callback
// ============================================================================

/// Told about every message a cycle saw, exactly once per receive.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// `error` is set when processing failed.
    async fn on_message_completed(
        &self,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    );
}

/// Completion handler that only logs failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCompletionHandler;

#[async_trait]
impl CompletionHandler for LoggingCompletionHandler {
    async fn on_message_completed(
        &self,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) {
        match error {
            Some(e) => warn!(message_id = %message.id, error = %e, "Message processing failed"),
            None => debug!(message_id = %message.id, "Message processed"),
        }
    }
}

// ============================================================================
// Worker Executors
// ============================================================================

/// Handle to a spawned polling loop.
pub struct WorkerHandle {
    name: String,
    done: oneshot::Receiver<()>,
}

impl WorkerHandle {
    fn new(name: String) -> (Self, oneshot::Sender<()>) {
        let (tx, done) = oneshot::channel();
        (Self { name, done }, tx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the loop to finish.
    ///
    /// Returns `false` if the loop was torn down without finishing.
    pub async fn join(self) -> bool {
        self.done.await.is_ok()
    }
}

/// Decides where polling loops run.
pub trait WorkerExecutor: Send + Sync {
    fn spawn(
        &self,
        name: String,
        worker: BoxFuture<'static, ()>,
    ) -> Result<WorkerHandle, TransportError>;
}

/// Runs loops as tasks on the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl WorkerExecutor for TokioExecutor {
    fn spawn(
        &self,
        name: String,
        worker: BoxFuture<'static, ()>,
    ) -> Result<WorkerHandle, TransportError> {
        let (handle, done) = WorkerHandle::new(name);
        tokio::spawn(async move {
            worker.await;
            let _ = done.send(());
        });
        Ok(handle)
    }
}

/// Runs each loop on its own named OS thread with a current-thread runtime.
///
/// Keeps long blocking receives and slow processors off the host's runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedicatedThreadExecutor;

impl WorkerExecutor for DedicatedThreadExecutor {
    fn spawn(
        &self,
        name: String,
        worker: BoxFuture<'static, ()>,
    ) -> Result<WorkerHandle, TransportError> {
        let (handle, done) = WorkerHandle::new(name.clone());
        let thread_name = name.clone();

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(worker),
                    Err(e) => {
                        error!(worker = %thread_name, error = %e, "Failed to build worker runtime")
                    }
                }
                let _ = done.send(());
            })
            .map_err(|e| TransportError::WorkerSpawnFailed {
                worker: name,
                message: e.to_string(),
            })?;

        Ok(handle)
    }
}

// ============================================================================
// Polling Engine
// ============================================================================

enum RunState {
    Idle,
    Running {
        shutdown: watch::Sender<bool>,
        workers: Vec<WorkerHandle>,
    },
    Stopped,
}

/// Runs and supervises the receive loops for one work queue.
///
/// An engine is started once and stopped once.
pub struct PollingEngine {
    transport: Transport,
    work_queue: Address,
    queue_name: String,
    strategy: Arc<dyn ReceiveStrategy>,
    completion: Arc<dyn CompletionHandler>,
    breaker: Arc<dyn CircuitBreaker>,
    executor: Arc<dyn WorkerExecutor>,
    purger: Option<Arc<dyn QueuePurger>>,
    stop_timeout: Duration,
    active: Arc<AtomicUsize>,
    run: Mutex<RunState>,
}

impl PollingEngine {
    /// Create an idle engine.
    ///
    /// # Arguments
    ///
    /// * `transport` - Shared transport context used to mint queue handles
    /// * `work_queue` - Address of the queue to poll
    /// * `strategy` - Receive strategy run by every loop
    /// * `completion` - Told about every received message
    /// * `breaker` - Failure tracking shared by all loops
    pub fn new(
        transport: Transport,
        work_queue: Address,
        strategy: Arc<dyn ReceiveStrategy>,
        completion: Arc<dyn CompletionHandler>,
        breaker: Arc<dyn CircuitBreaker>,
    ) -> Self {
        Self {
            queue_name: transport.queue_name(&work_queue),
            transport,
            work_queue,
            strategy,
            completion,
            breaker,
            executor: Arc::new(TokioExecutor),
            purger: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            active: Arc::new(AtomicUsize::new(0)),
            run: Mutex::new(RunState::Idle),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn WorkerExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Purge the work queue before the loops start
    pub fn with_purge_on_startup(mut self, purger: Arc<dyn QueuePurger>) -> Self {
        self.purger = Some(purger);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Wire an engine from loaded settings.
    ///
    /// Validates the settings, builds the transport and the receive strategy
    /// and picks the executor. Call [`PollingEngine::start`] with
    /// `settings.max_concurrency` to run it.
    pub fn from_settings<B>(
        settings: &TransportSettings,
        broker: Arc<B>,
        processor: Arc<dyn MessageProcessor>,
        completion: Arc<dyn CompletionHandler>,
        notifier: Arc<dyn CriticalErrorNotifier>,
    ) -> Result<Self, TransportError>
    where
        B: Broker + QueuePurger + 'static,
    {
        settings.validate()?;

        let transport = Transport::new(broker.clone(), settings.connection_params()?)
            .with_receive_wait(settings.receive_wait());
        let work_queue = settings.work_queue_address()?;
        let error_queue = settings.error_queue_address()?;

        let strategy = ReceiveStrategyFactory::new(transport.clone(), error_queue)
            .create(&settings.transaction_settings(), processor)?;
        let breaker = DefaultCircuitBreaker::new(
            settings.circuit_breaker_config(transport.queue_name(&work_queue)),
            notifier,
        );

        let mut engine = Self::new(transport, work_queue, strategy, completion, Arc::new(breaker))
            .with_stop_timeout(settings.stop_timeout());
        if settings.dedicated_threads {
            engine = engine.with_executor(Arc::new(DedicatedThreadExecutor));
        }
        if settings.purge_on_startup {
            engine = engine.with_purge_on_startup(broker);
        }
        Ok(engine)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Number of loops currently alive
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.run.lock().await, RunState::Running { .. })
    }

    /// Start `max_concurrency` polling loops.
    ///
    /// # Errors
    ///
    /// - [`TransportError::AlreadyStarted`] if the engine was started before
    /// - [`TransportError::Configuration`] if `max_concurrency` is zero
    /// - Purge or spawn failures; no loop is left running in that case
    pub async fn start(&self, max_concurrency: usize) -> Result<(), TransportError> {
        let mut run = self.run.lock().await;
        if !matches!(*run, RunState::Idle) {
            return Err(TransportError::AlreadyStarted {
                queue_name: self.queue_name.clone(),
            });
        }
        if max_concurrency == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrency must be at least 1".to_string(),
            }
            .into());
        }

        if let Some(purger) = &self.purger {
            let purged = purger.purge(&self.queue_name).await?;
            info!(queue = %self.queue_name, purged, "Purged work queue on startup");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(max_concurrency);
        for slot in 0..max_concurrency {
            let worker = Worker {
                slot,
                transport: self.transport.clone(),
                work_queue: self.work_queue.clone(),
                queue_name: self.queue_name.clone(),
                strategy: Arc::clone(&self.strategy),
                completion: Arc::clone(&self.completion),
                breaker: Arc::clone(&self.breaker),
                active: Arc::clone(&self.active),
            };
            let name = format!("aq-worker-{}", slot);
            match self
                .executor
                .spawn(name, worker.supervise(shutdown_rx.clone()).boxed())
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let _ = shutdown.send(true);
                    join_all(workers.into_iter().map(WorkerHandle::join)).await;
                    return Err(e);
                }
            }
        }

        info!(queue = %self.queue_name, workers = max_concurrency, "Polling engine started");
        *run = RunState::Running { shutdown, workers };
        Ok(())
    }

    /// Signal cancellation, wait for every loop to exit and dispose the
    /// circuit breaker.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotRunning`] if the engine is not running
    /// - [`TransportError::StopTimedOut`] if loops are still busy after the
    ///   stop timeout; they exit on their own once their cycle ends
    pub async fn stop(&self) -> Result<(), TransportError> {
        let (shutdown, workers) = {
            let mut run = self.run.lock().await;
            match std::mem::replace(&mut *run, RunState::Stopped) {
                RunState::Running { shutdown, workers } => (shutdown, workers),
                other => {
                    *run = other;
                    return Err(TransportError::NotRunning {
                        queue_name: self.queue_name.clone(),
                    });
                }
            }
        };

        info!(queue = %self.queue_name, "Stopping polling engine");
        let _ = shutdown.send(true);

        let joined = tokio::time::timeout(
            self.stop_timeout,
            join_all(workers.into_iter().map(WorkerHandle::join)),
        )
        .await;
        self.breaker.dispose();

        match joined {
            Ok(_) => {
                info!(queue = %self.queue_name, "Polling engine stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    queue = %self.queue_name,
                    active = self.active_workers(),
                    "Polling loops did not exit in time"
                );
                Err(TransportError::StopTimedOut {
                    queue_name: self.queue_name.clone(),
                    waited: self.stop_timeout,
                })
            }
        }
    }
}

// ============================================================================
// Polling Loop
// ============================================================================

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Counts a loop as active for as long as it lives
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker {
    slot: usize,
    transport: Transport,
    work_queue: Address,
    queue_name: String,
    strategy: Arc<dyn ReceiveStrategy>,
    completion: Arc<dyn CompletionHandler>,
    breaker: Arc<dyn CircuitBreaker>,
    active: Arc<AtomicUsize>,
}

impl Worker {
    /// Run loops until shutdown, restarting on a fresh handle after a fault
    async fn supervise(self, mut shutdown: watch::Receiver<bool>) {
        let _active = ActiveGuard::enter(&self.active);
        debug!(queue = %self.queue_name, worker = self.slot, "Polling loop started");

        while !is_shutdown(&shutdown) {
            let handle = self.transport.queue_handle(&self.work_queue);
            let outcome = AssertUnwindSafe(self.run(handle, &shutdown))
                .catch_unwind()
                .await;

            let fault = match outcome {
                Ok(Ok(())) => break,
                Ok(Err(e)) => e,
                Err(panic) => TransportError::WorkerPanicked {
                    message: panic_message(panic.as_ref()),
                },
            };

            error!(
                queue = %self.queue_name,
                worker = self.slot,
                error = %fault,
                transient = fault.is_transient(),
                "Polling loop faulted; restarting"
            );

            tokio::select! {
                _ = self.breaker.failure(&fault) => {}
                _ = shutdown.changed() => {}
            }
        }

        debug!(queue = %self.queue_name, worker = self.slot, "Polling loop exited");
    }

    async fn run(
        &self,
        mut handle: QueueHandle,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let result = self.cycles(&mut handle, shutdown).await;
        handle.complete().await;
        result
    }

    async fn cycles(
        &self,
        handle: &mut QueueHandle,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        while !is_shutdown(shutdown) {
            match self.strategy.try_receive_from(handle).await? {
                ReceiveResult::NoMessage => {}
                ReceiveResult::Received(message) => {
                    self.completion.on_message_completed(&message, None).await;
                }
                ReceiveResult::FailedProcessing { message, error } => {
                    warn!(
                        queue = %self.queue_name,
                        worker = self.slot,
                        message_id = %message.id,
                        error = %error,
                        "Message processing failed"
                    );
                    self.completion
                        .on_message_completed(&message, Some(&error))
                        .await;
                }
            }
            self.breaker.success();
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "polling_tests.rs"]
mod tests;
