//! Restartable background loops.
//!
//! A [`Service`] drives a [`Routine`] on its own Tokio task: it calls
//! [`Routine::run`] once per iteration and then sleeps for the configured
//! loop rate. Stopping never aborts the task. It cancels the run's
//! [`StopSignal`], which wakes every wait that is `select!`-ed on it, and the
//! loop exits after the in-flight iteration returns.
//!
//! State machine: `Idle -> Running -> Stopping -> Stopped -> Running -> ...`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::error::CoreError;

/// Loop rate used when none is configured (10 iterations per second).
pub const DEFAULT_LOOP_RATE: Duration = Duration::from_millis(100);

/// Fastest permitted loop rate (no more than 60 iterations per second).
pub const MIN_LOOP_RATE: Duration = Duration::from_millis(1000 / 60);

/// Lifecycle state of a [`Service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed but never started.
    Idle,
    /// The loop is executing iterations.
    Running,
    /// Stop was requested; the final iteration may still be in flight.
    Stopping,
    /// The loop task has fully exited.
    Stopped,
}

impl ServiceState {
    /// Returns `true` if no loop task is alive for this state.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped)
    }

    /// Returns the lowercase name of this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Stop notification handed to every [`Routine::run`] call.
///
/// Routines that block (waiting for a job, a socket read, a notification)
/// should `select!` on [`StopSignal::stopped`] so a stop request wakes them.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// Returns `true` once the owning service has been asked to stop.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the owning service is asked to stop.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

/// The repeated body of a [`Service`].
#[async_trait]
pub trait Routine: Send + Sync + 'static {
    /// Executes one iteration.
    ///
    /// Errors are logged by the service loop and never end it.
    async fn run(&self, stop: &StopSignal) -> anyhow::Result<()>;

    /// Called once after the final iteration, before the service reports
    /// itself stopped. Default is a no-op.
    async fn on_stop(&self) {}
}

/// A named, restartable loop running on a dedicated Tokio task.
///
/// Expected conditions (starting a running service, stopping a stopped one)
/// are reported through `bool` results. Only configuration errors use
/// `Result`.
pub struct Service {
    name: Mutex<String>,
    loop_rate: Mutex<Duration>,
    state: Arc<watch::Sender<ServiceState>>,
    /// Token of the current run. Locked across every state transition made
    /// by `start` and `stop` so the two never interleave.
    token: Mutex<Option<CancellationToken>>,
}

impl Service {
    /// Creates an idle service with the default loop rate.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate(name, DEFAULT_LOOP_RATE)
    }

    /// Creates an idle service with an already validated loop rate.
    pub(crate) fn with_rate(name: impl Into<String>, rate: Duration) -> Self {
        let (state, _rx) = watch::channel(ServiceState::Idle);
        Self {
            name: Mutex::new(name.into()),
            loop_rate: Mutex::new(rate),
            state: Arc::new(state),
            token: Mutex::new(None),
        }
    }

    /// Returns the service name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the service. The new name is used from the next start.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    /// Returns the configured pause between iterations.
    #[must_use]
    pub fn loop_rate(&self) -> Duration {
        *self.loop_rate.lock()
    }

    /// Sets the pause between iterations, taking effect on the next start.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LoopRateTooLow`] if `rate` is below
    /// [`MIN_LOOP_RATE`]; the current rate is left unchanged.
    pub fn set_loop_rate(&self, rate: Duration) -> Result<(), CoreError> {
        if rate < MIN_LOOP_RATE {
            return Err(CoreError::LoopRateTooLow {
                requested: rate,
                minimum: MIN_LOOP_RATE,
            });
        }
        *self.loop_rate.lock() = rate;
        Ok(())
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Returns `true` while the loop is running and no stop was requested.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Returns `true` if the service never started or has fully stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Spawns the loop task driving `routine`.
    ///
    /// Returns `false` without side effects unless the service is idle or
    /// fully stopped. Must be called from within a Tokio runtime.
    pub fn start<R: Routine>(&self, routine: Arc<R>) -> bool {
        let mut current = self.token.lock();
        let started = self.state.send_if_modified(|state| {
            if state.is_finished() {
                *state = ServiceState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return false;
        }

        let token = CancellationToken::new();
        *current = Some(token.clone());

        let name = self.name();
        let rate = self.loop_rate();
        let guard = FinishGuard {
            state: Arc::clone(&self.state),
        };
        let span = tracing::info_span!("service", name = %name);
        tokio::spawn(
            run_loop(routine, StopSignal { token }, rate, guard).instrument(span),
        );

        info!(service = %name, "service starting");
        true
    }

    /// Requests the loop to exit after its current iteration.
    ///
    /// Returns `false` without side effects unless the service is running.
    pub fn stop(&self) -> bool {
        let current = self.token.lock();
        let stopping = self.state.send_if_modified(|state| {
            if *state == ServiceState::Running {
                *state = ServiceState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            return false;
        }

        if let Some(token) = current.as_ref() {
            token.cancel();
        }
        info!(service = %self.name(), "service stopping");
        true
    }

    /// Waits until the loop task has exited.
    ///
    /// Returns immediately if the service never started. With a timeout,
    /// gives up once it elapses. Returns `true` if the service is finished.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.state.subscribe();
        let finished = async move { rx.wait_for(|state| state.is_finished()).await.is_ok() };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .unwrap_or(false),
            None => finished.await,
        }
    }

    /// Stops the service, waits for it to exit, then starts it again.
    pub async fn restart<R: Routine>(&self, routine: Arc<R>) -> bool {
        self.stop();
        self.join(None).await;
        self.start(routine)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name())
            .field("state", &self.state().as_str())
            .field("loop_rate", &self.loop_rate())
            .finish()
    }
}

async fn run_loop<R: Routine>(
    routine: Arc<R>,
    signal: StopSignal,
    rate: Duration,
    _guard: FinishGuard,
) {
    while !signal.is_stopped() {
        if let Err(e) = routine.run(&signal).await {
            error!("service iteration failed: {e:#}");
        }
        tokio::select! {
            () = signal.stopped() => {}
            () = tokio::time::sleep(rate) => {}
        }
    }
    routine.on_stop().await;
}

/// Marks the service stopped when the loop task ends, including by panic.
struct FinishGuard {
    state: Arc<watch::Sender<ServiceState>>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.state.send_replace(ServiceState::Stopped);
        debug!("service stopped");
    }
}
