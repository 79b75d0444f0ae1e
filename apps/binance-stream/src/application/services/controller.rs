//! Stream Controller
//!
//! Runs a [`StreamOperation`] as a supervised, cancellable background task
//! that reconnects after failures.
//!
//! # State machine
//!
//! ```text
//! Idle ──begin()──► Running ──error──► Pausing ──delay──► Running
//!  ▲                   │                                     │
//!  └──cancel / no topics / retries exhausted─────────────────┘
//! ```
//!
//! `begin()` only leaves `Idle` when the operation has topics and is not
//! already streaming. Cancellation is a normal completion, never an error.
//! A `Pausing` event is published before every delay.
//!
//! With a maintenance check configured, a failed attempt first polls the
//! exchange system status. While it reports maintenance the controller
//! publishes `Pausing` every check interval; this waiting does not count
//! against the retry budget and resets the backoff once it clears.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::RetryStrategy;
use crate::application::ports::{ExchangeRest, StreamOperation};
use crate::domain::market::SystemStatus;
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerStatus {
    /// Nothing running; `begin()` may start a run.
    Idle,
    /// A connection attempt is in progress.
    Running,
    /// Waiting before the next attempt.
    Pausing,
    /// Cancellation requested; settling back to idle.
    Cancelling,
}

/// Why the controller is pausing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Waiting before reconnect attempt `attempt` (0 after a clean close).
    Reconnect {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// Exchange reports maintenance.
    Maintenance,
}

/// Notification published by a controller.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A connection attempt failed.
    Error(Arc<dyn Error + Send + Sync>),
    /// About to wait `delay` before doing anything else.
    Pausing {
        /// Length of the wait.
        delay: Duration,
        /// Why the controller waits.
        reason: PauseReason,
    },
}

/// Errors raised by the controller itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControllerError {
    /// The retry policy gave up.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Exchange status polling used by the maintenance-aware variant.
#[derive(Clone)]
pub struct MaintenanceCheck {
    /// REST collaborator providing the system status.
    pub rest: Arc<dyn ExchangeRest>,
    /// Fixed polling interval while maintenance lasts.
    pub interval: Duration,
}

impl std::fmt::Debug for MaintenanceCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceCheck")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

const EVENT_CAPACITY: usize = 64;

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Debug)]
struct State {
    status: ControllerStatus,
    run: Option<RunHandle>,
}

type SharedState = Arc<Mutex<State>>;

fn set_status(state: &SharedState, status: ControllerStatus) {
    let mut state = state.lock();
    if state.status != ControllerStatus::Cancelling {
        state.status = status;
    }
}

/// Settles the controller to `Idle` however the supervisor task ends.
struct SettleGuard {
    state: SharedState,
    done: watch::Sender<bool>,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            state.status = ControllerStatus::Idle;
            state.run = None;
        }
        self.done.send_replace(true);
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Supervises one streaming operation (one physical connection).
pub struct StreamController {
    operation: Arc<dyn StreamOperation>,
    strategy: RetryStrategy,
    maintenance: Option<MaintenanceCheck>,
    state: SharedState,
    events: broadcast::Sender<ControllerEvent>,
}

impl StreamController {
    /// Create an idle controller.
    #[must_use]
    pub fn new(operation: Arc<dyn StreamOperation>, strategy: RetryStrategy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            operation,
            strategy,
            maintenance: None,
            state: Arc::new(Mutex::new(State {
                status: ControllerStatus::Idle,
                run: None,
            })),
            events,
        }
    }

    /// Enable the maintenance-aware retry loop.
    #[must_use]
    pub fn with_maintenance_check(
        mut self,
        rest: Arc<dyn ExchangeRest>,
        interval: Duration,
    ) -> Self {
        self.maintenance = Some(MaintenanceCheck { rest, interval });
        self
    }

    /// Start a supervised run.
    ///
    /// Returns `false` (and does nothing) unless the controller is idle,
    /// the operation has topics and it is not already streaming. Must be
    /// called from within a Tokio runtime.
    pub fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != ControllerStatus::Idle || state.run.is_some() {
            return false;
        }
        if !self.operation.is_ready() || self.operation.is_running() {
            return false;
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        state.status = ControllerStatus::Running;
        state.run = Some(RunHandle {
            cancel: cancel.clone(),
            done: done_rx,
        });
        drop(state);

        let supervisor = Supervisor {
            operation: Arc::clone(&self.operation),
            strategy: self.strategy.clone(),
            maintenance: self.maintenance.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            cancel,
        };
        let settle = SettleGuard {
            state: Arc::clone(&self.state),
            done: done_tx,
        };
        tokio::spawn(async move {
            let _settle = settle;
            supervisor.run().await;
        });
        true
    }

    /// Cancel the current run and wait until it has settled.
    ///
    /// Idempotent; returns immediately when idle.
    pub async fn cancel(&self) {
        let handle = {
            let mut state = self.state.lock();
            let handle = state
                .run
                .as_ref()
                .map(|run| (run.cancel.clone(), run.done.clone()));
            if handle.is_some() {
                state.status = ControllerStatus::Cancelling;
            }
            handle
        };

        if let Some((cancel, done)) = handle {
            debug!(stream = self.operation.name(), "cancelling stream controller");
            cancel.cancel();
            wait_done(done).await;
        }
    }

    /// Wait until the current run (if any) ends on its own.
    pub async fn stopped(&self) {
        let done = self.state.lock().run.as_ref().map(|run| run.done.clone());
        if let Some(done) = done {
            wait_done(done).await;
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        self.state.lock().status
    }

    /// Whether no run is active.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.status == ControllerStatus::Idle && state.run.is_none()
    }

    /// Subscribe to `Error` and `Pausing` notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// The supervised operation.
    #[must_use]
    pub fn operation(&self) -> &Arc<dyn StreamOperation> {
        &self.operation
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Some(run) = self.state.lock().run.as_ref() {
            run.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("stream", &self.operation.name())
            .field("status", &self.status())
            .field("strategy", &self.strategy)
            .field("maintenance", &self.maintenance)
            .finish()
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // Err means the supervisor is gone, which also means it is done.
    let _ = done.wait_for(|stopped| *stopped).await;
}

// =============================================================================
// Supervisor
// =============================================================================

enum MaintenanceWait {
    NotActive,
    Cleared,
    Cancelled,
}

struct Supervisor {
    operation: Arc<dyn StreamOperation>,
    strategy: RetryStrategy,
    maintenance: Option<MaintenanceCheck>,
    state: SharedState,
    events: broadcast::Sender<ControllerEvent>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let name = self.operation.name();
        let mut policy = self.strategy.build();
        info!(stream = name, "stream controller started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.operation.is_ready() {
                info!(stream = name, "no topics subscribed, stream controller settling");
                break;
            }

            set_status(&self.state, ControllerStatus::Running);
            let opened_before = self.operation.opened_count();
            let result = self.operation.run(self.cancel.clone()).await;
            if self.cancel.is_cancelled() {
                break;
            }
            if self.operation.opened_count() != opened_before {
                policy.reset();
            }

            let (delay, attempt) = match result {
                Ok(()) => {
                    info!(stream = name, "connection closed by peer");
                    policy.reset();
                    (self.strategy.initial_delay(), 0)
                }
                Err(error) => {
                    let error: Arc<dyn Error + Send + Sync> = Arc::from(error);
                    warn!(stream = name, error = %error, "stream attempt failed");
                    metrics::record_reconnect(name);
                    let _ = self.events.send(ControllerEvent::Error(error));

                    match self.await_maintenance().await {
                        MaintenanceWait::Cancelled => break,
                        MaintenanceWait::Cleared => policy.reset(),
                        MaintenanceWait::NotActive => {}
                    }

                    let Some(delay) = policy.next_delay() else {
                        let attempts = policy.attempt_count();
                        warn!(stream = name, attempts, "giving up on stream");
                        let _ = self.events.send(ControllerEvent::Error(Arc::new(
                            ControllerError::RetriesExhausted { attempts },
                        )));
                        break;
                    };
                    (delay, policy.attempt_count())
                }
            };

            set_status(&self.state, ControllerStatus::Pausing);
            info!(
                stream = name,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "reconnecting after delay"
            );
            let _ = self.events.send(ControllerEvent::Pausing {
                delay,
                reason: PauseReason::Reconnect { attempt },
            });

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(stream = name, "stream controller stopped");
    }

    async fn await_maintenance(&self) -> MaintenanceWait {
        let Some(check) = &self.maintenance else {
            return MaintenanceWait::NotActive;
        };
        let name = self.operation.name();
        let mut waited = false;

        loop {
            let status = tokio::select! {
                () = self.cancel.cancelled() => return MaintenanceWait::Cancelled,
                status = check.rest.system_status() => status,
            };

            match status {
                Ok(SystemStatus::Maintenance) => {
                    if !waited {
                        warn!(stream = name, "exchange under maintenance, pausing stream");
                    }
                    waited = true;
                    metrics::record_maintenance_pause(name);
                    set_status(&self.state, ControllerStatus::Pausing);
                    let _ = self.events.send(ControllerEvent::Pausing {
                        delay: check.interval,
                        reason: PauseReason::Maintenance,
                    });

                    tokio::select! {
                        () = self.cancel.cancelled() => return MaintenanceWait::Cancelled,
                        () = tokio::time::sleep(check.interval) => {}
                    }
                }
                Ok(SystemStatus::Normal) => {
                    if waited {
                        info!(stream = name, "exchange maintenance over");
                        return MaintenanceWait::Cleared;
                    }
                    return MaintenanceWait::NotActive;
                }
                Err(error) => {
                    warn!(stream = name, error = %error, "system status check failed");
                    return if waited {
                        MaintenanceWait::Cleared
                    } else {
                        MaintenanceWait::NotActive
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::application::ports::{MockExchangeRest, OperationError};
    use crate::application::services::retry::ReconnectConfig;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Fail,
        Close,
        Block,
    }

    #[derive(Default)]
    struct ScriptedOperation {
        script: Mutex<VecDeque<Step>>,
        not_ready: AtomicBool,
        running: AtomicBool,
        runs: AtomicU32,
        opened: AtomicU64,
        /// Blocked runs outlive cancellation until `release` is notified.
        hold_after_cancel: AtomicBool,
        release: Notify,
    }

    impl ScriptedOperation {
        fn new(steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.iter().copied().collect()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl StreamOperation for ScriptedOperation {
        async fn run(&self, cancel: CancellationToken) -> Result<(), OperationError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            let step = self.script.lock().pop_front().unwrap_or(Step::Block);
            let result = match step {
                Step::Fail => Err("connection refused".into()),
                Step::Close => {
                    self.opened.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Step::Block => {
                    self.opened.fetch_add(1, Ordering::SeqCst);
                    cancel.cancelled().await;
                    if self.hold_after_cancel.load(Ordering::SeqCst) {
                        self.release.notified().await;
                    }
                    Ok(())
                }
            };
            self.running.store(false, Ordering::SeqCst);
            result
        }

        fn is_ready(&self) -> bool {
            !self.not_ready.load(Ordering::SeqCst)
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn opened_count(&self) -> u64 {
            self.opened.load(Ordering::SeqCst)
        }

        fn name(&self) -> &'static str {
            "test"
        }
    }

    fn backoff(max_attempts: u32) -> RetryStrategy {
        RetryStrategy::Exponential(ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        })
    }

    async fn next_event(events: &mut broadcast::Receiver<ControllerEvent>) -> ControllerEvent {
        tokio::time::timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("timed out waiting for controller event")
            .expect("event channel closed")
    }

    fn pause_of(event: &ControllerEvent) -> (Duration, PauseReason) {
        match event {
            ControllerEvent::Pausing { delay, reason } => (*delay, *reason),
            ControllerEvent::Error(error) => panic!("expected pausing, got error {error}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn begin_requires_topics() {
        let operation = ScriptedOperation::new(&[]);
        operation.not_ready.store(true, Ordering::SeqCst);
        let controller = StreamController::new(operation.clone(), backoff(0));

        assert!(!controller.begin());
        assert!(controller.is_idle());
        assert_eq!(operation.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn begin_is_rejected_while_running() {
        let operation = ScriptedOperation::new(&[Step::Block]);
        let controller = StreamController::new(operation.clone(), backoff(0));

        assert!(controller.begin());
        assert!(!controller.begin());
        assert_eq!(controller.status(), ControllerStatus::Running);

        controller.cancel().await;
        assert!(controller.is_idle());
        assert_eq!(operation.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_not_an_error_and_is_idempotent() {
        let operation = ScriptedOperation::new(&[Step::Block]);
        let controller = StreamController::new(operation.clone(), backoff(0));
        let mut events = controller.events();

        controller.begin();
        tokio::task::yield_now().await;
        controller.cancel().await;
        controller.cancel().await;

        assert!(controller.is_idle());
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_when_idle_returns_immediately() {
        let controller = StreamController::new(ScriptedOperation::new(&[]), backoff(0));
        controller.cancel().await;
        assert!(controller.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_publish_error_then_growing_pauses() {
        let operation = ScriptedOperation::new(&[Step::Fail, Step::Fail, Step::Fail]);
        let controller = StreamController::new(operation.clone(), backoff(0));
        let mut events = controller.events();

        controller.begin();

        let mut delays = Vec::new();
        for _ in 0..3 {
            assert!(matches!(next_event(&mut events).await, ControllerEvent::Error(_)));
            let (delay, reason) = pause_of(&next_event(&mut events).await);
            assert!(matches!(reason, PauseReason::Reconnect { .. }));
            delays.push(delay.as_millis());
        }
        assert_eq!(delays, vec![100, 200, 400]);

        controller.cancel().await;
        assert!(operation.runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_reconnects_after_initial_delay() {
        let operation = ScriptedOperation::new(&[Step::Fail, Step::Close]);
        let controller = StreamController::new(operation.clone(), backoff(0));
        let mut events = controller.events();

        controller.begin();

        assert!(matches!(next_event(&mut events).await, ControllerEvent::Error(_)));
        let _ = next_event(&mut events).await;
        let (delay, reason) = pause_of(&next_event(&mut events).await);
        assert_eq!(delay, Duration::from_millis(100));
        assert_eq!(reason, PauseReason::Reconnect { attempt: 0 });

        controller.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_settle_to_idle() {
        let operation = ScriptedOperation::new(&[Step::Fail, Step::Fail, Step::Fail]);
        let controller = StreamController::new(
            operation.clone(),
            RetryStrategy::Fixed {
                delay: Duration::from_secs(1),
                max_attempts: 2,
            },
        );
        let mut events = controller.events();

        controller.begin();
        controller.stopped().await;

        let mut errors = 0;
        let mut exhausted = false;
        while let Ok(event) = events.try_recv() {
            if let ControllerEvent::Error(error) = event {
                errors += 1;
                exhausted |= error.to_string().contains("exhausted");
            }
        }
        assert_eq!(errors, 4);
        assert!(exhausted);
        assert!(controller.is_idle());
        assert_eq!(operation.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn begin_during_cancel_is_rejected() {
        let operation = ScriptedOperation::new(&[Step::Block]);
        operation.hold_after_cancel.store(true, Ordering::SeqCst);
        let controller = Arc::new(StreamController::new(operation.clone(), backoff(0)));
        assert!(controller.begin());
        while !operation.running.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let cancelling = Arc::clone(&controller);
        let cancel = tokio::spawn(async move { cancelling.cancel().await });
        while controller.status() != ControllerStatus::Cancelling {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.status(), ControllerStatus::Cancelling);
        assert!(!controller.begin());
        assert_eq!(operation.runs.load(Ordering::SeqCst), 1);

        operation.hold_after_cancel.store(false, Ordering::SeqCst);
        operation.release.notify_one();
        cancel.await.unwrap();
        assert!(controller.is_idle());
        assert_eq!(operation.runs.load(Ordering::SeqCst), 1);

        assert!(controller.begin());
        controller.cancel().await;
        assert!(controller.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_topics_disappear() {
        let operation = ScriptedOperation::new(&[Step::Close]);
        let controller = StreamController::new(operation.clone(), backoff(0));
        let mut events = controller.events();

        controller.begin();
        let _ = next_event(&mut events).await;
        operation.not_ready.store(true, Ordering::SeqCst);
        controller.stopped().await;

        assert!(controller.is_idle());
        assert_eq!(operation.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_pauses_at_fixed_interval_without_backoff_growth() {
        let interval = Duration::from_secs(60);
        let mut rest = MockExchangeRest::new();
        let mut statuses = VecDeque::from(vec![
            SystemStatus::Maintenance,
            SystemStatus::Maintenance,
            SystemStatus::Maintenance,
            SystemStatus::Normal,
            SystemStatus::Normal,
        ]);
        rest.expect_system_status()
            .returning(move || Ok(statuses.pop_front().unwrap_or(SystemStatus::Normal)));

        let operation = ScriptedOperation::new(&[Step::Fail, Step::Fail]);
        let controller = StreamController::new(operation.clone(), backoff(0))
            .with_maintenance_check(Arc::new(rest), interval);
        let mut events = controller.events();

        controller.begin();

        assert!(matches!(next_event(&mut events).await, ControllerEvent::Error(_)));
        for _ in 0..3 {
            let (delay, reason) = pause_of(&next_event(&mut events).await);
            assert_eq!(reason, PauseReason::Maintenance);
            assert_eq!(delay, interval);
        }
        let (delay, reason) = pause_of(&next_event(&mut events).await);
        assert_eq!(reason, PauseReason::Reconnect { attempt: 1 });
        assert_eq!(delay, Duration::from_millis(100));

        assert!(matches!(next_event(&mut events).await, ControllerEvent::Error(_)));
        let (delay, _) = pause_of(&next_event(&mut events).await);
        assert_eq!(delay, Duration::from_millis(200));

        controller.cancel().await;
    }
}
