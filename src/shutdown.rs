//! Graceful-drain shutdown for server-side sessions.
//!
//! [`ShutdownCoordinator`] tracks every open connection and stream through
//! RAII guards. Shutdown moves the process through `running → draining →
//! stopped`: registrations are refused as soon as draining starts, in-flight
//! exchanges get a short grace period, every tracked stream is then told to
//! cancel, and the coordinator polls until all guards are gone or the drain
//! timeout elapses. Cleanup callbacks run last, in registration order, each
//! isolated from the failures and panics of the others.

use std::{
    fmt,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use log::{error, info, warn};
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionError, Rejection};

/// Boxed error returned by cleanup callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Timing for the drain sequence.
///
/// # Default Values
/// - `grace_period`: 500 milliseconds
/// - `drain_timeout`: 10 seconds, measured from entry into `draining`
/// - `poll_interval`: 50 milliseconds
/// - `retry_after`: 5 seconds, advertised to refused registrations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Pause before cancelling streams so in-flight exchanges can finish.
    pub grace_period: Duration,
    /// Hard bound on the whole draining phase, grace period included.
    pub drain_timeout: Duration,
    /// How often tracked counts are re-checked while draining.
    pub poll_interval: Duration,
    /// Retry hint attached to registrations refused while draining.
    pub retry_after: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            retry_after: Duration::from_secs(5),
        }
    }
}

impl ShutdownConfig {
    /// Clamp the grace period into the drain timeout and keep the poll
    /// interval at or above one millisecond.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.grace_period = self.grace_period.min(self.drain_timeout);
        self.poll_interval = self.poll_interval.max(Duration::from_millis(1));
        self
    }
}

/// Process lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Accepting sessions.
    Running = 0,
    /// Refusing sessions and draining tracked ones.
    Draining = 1,
    /// Drain and cleanup finished.
    Stopped = 2,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    /// Lower-case name used by health reporting.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Registration refused because shutdown has begun.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("server shutting down ({state})")]
pub struct ShutdownError {
    /// State observed when the registration was refused.
    pub state: LifecycleState,
    /// Suggested wait before retrying against another instance or later.
    pub retry_after: Duration,
}

impl From<ShutdownError> for AdmissionError {
    fn from(err: ShutdownError) -> Self {
        AdmissionError::ShuttingDown(Rejection::new(0, 0, err.retry_after, Instant::now()))
    }
}

/// Read-only view for health endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Tracked connections.
    pub connections: usize,
    /// Tracked streams.
    pub streams: usize,
    /// Cleanup callbacks not yet run.
    pub pending_cleanups: usize,
}

/// Summary of a completed drain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// `true` when the drain timeout elapsed with sessions still tracked.
    pub forced: bool,
    /// Streams still tracked when cleanup began.
    pub remaining_streams: usize,
    /// Connections still tracked when cleanup began.
    pub remaining_connections: usize,
    /// Names and messages of cleanup callbacks that failed or panicked.
    pub cleanup_failures: Vec<String>,
    /// Time from entering `draining` to `stopped`.
    pub elapsed: Duration,
}

/// Future resolving once the coordinator reaches `stopped`.
pub type ShutdownFuture = Shared<BoxFuture<'static, ShutdownReport>>;

struct Inner {
    config: ShutdownConfig,
    state: AtomicU8,
    next_id: AtomicU64,
    connections: DashMap<u64, Option<SocketAddr>>,
    streams: DashMap<u64, CancellationToken>,
    cleanups: Mutex<Vec<(String, Cleanup)>>,
    drain: Mutex<Option<ShutdownFuture>>,
    draining: CancellationToken,
    cancel_all: CancellationToken,
}

impl Inner {
    fn state(&self) -> LifecycleState { LifecycleState::from_u8(self.state.load(Ordering::SeqCst)) }

    fn refuse(&self) -> ShutdownError {
        ShutdownError {
            state: self.state(),
            retry_after: self.config.retry_after,
        }
    }

    fn cleanups(&self) -> MutexGuard<'_, Vec<(String, Cleanup)>> {
        self.cleanups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drain(self: Arc<Self>) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + self.config.drain_timeout;
        info!(
            "shutdown: draining connections={}, streams={}",
            self.connections.len(),
            self.streams.len()
        );

        sleep_until((started + self.config.grace_period).min(deadline)).await;
        self.cancel_all.cancel();

        let mut forced = false;
        while !(self.streams.is_empty() && self.connections.is_empty()) {
            let now = Instant::now();
            if now >= deadline {
                forced = true;
                warn!(
                    "shutdown: drain timeout elapsed, forcing cleanup: streams={}, connections={}",
                    self.streams.len(),
                    self.connections.len()
                );
                break;
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
        let remaining_streams = self.streams.len();
        let remaining_connections = self.connections.len();

        // Cleanups may register further cleanups; run batches until none are
        // left, then stop under the same lock `on_cleanup` checks.
        let mut cleanup_failures = Vec::new();
        loop {
            let batch = {
                let mut pending = self.cleanups();
                if pending.is_empty() {
                    self.state
                        .store(LifecycleState::Stopped as u8, Ordering::SeqCst);
                    break;
                }
                std::mem::take(&mut *pending)
            };
            for (name, cleanup) in batch {
                match AssertUnwindSafe(cleanup()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("shutdown: cleanup failed: name={name}, error={e}");
                        cleanup_failures.push(format!("{name}: {e}"));
                    }
                    Err(panic) => {
                        let panic_msg = crate::panic::format_panic(&*panic);
                        error!("shutdown: cleanup panicked: name={name}, panic={panic_msg}");
                        cleanup_failures.push(format!("{name}: panicked: {panic_msg}"));
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        info!("shutdown: stopped after {elapsed:?}, forced={forced}");
        ShutdownReport {
            forced,
            remaining_streams,
            remaining_connections,
            cleanup_failures,
            elapsed,
        }
    }
}

/// RAII registration of a connection. Untracks on drop.
#[must_use = "the connection is untracked as soon as the guard is dropped"]
pub struct ConnectionGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl ConnectionGuard {
    /// Token cancelled when the coordinator sweeps tracked sessions.
    #[must_use]
    pub fn cancelled_token(&self) -> CancellationToken { self.inner.cancel_all.child_token() }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections.remove(&self.id);
        crate::metrics::dec_connections();
    }
}

/// RAII registration of a stream. Untracks on drop.
#[must_use = "the stream is untracked as soon as the guard is dropped"]
pub struct StreamGuard {
    inner: Arc<Inner>,
    id: u64,
    token: CancellationToken,
}

impl StreamGuard {
    /// Token cancelled when this stream must stop.
    #[must_use]
    pub fn token(&self) -> &CancellationToken { &self.token }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.inner.streams.remove(&self.id);
        crate::metrics::dec_streams();
    }
}

/// Cloneable handle coordinating process shutdown.
#[derive(Clone)]
pub struct ShutdownCoordinator(Arc<Inner>);

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("config", &self.0.config)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self { Self::new(ShutdownConfig::default()) }
}

impl ShutdownCoordinator {
    /// Create a coordinator in the `running` state.
    #[must_use]
    pub fn new(config: ShutdownConfig) -> Self {
        Self(Arc::new(Inner {
            config: config.normalized(),
            state: AtomicU8::new(LifecycleState::Running as u8),
            next_id: AtomicU64::new(0),
            connections: DashMap::new(),
            streams: DashMap::new(),
            cleanups: Mutex::new(Vec::new()),
            drain: Mutex::new(None),
            draining: CancellationToken::new(),
            cancel_all: CancellationToken::new(),
        }))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState { self.0.state() }

    /// Returns `true` while new registrations are accepted.
    #[must_use]
    pub fn is_running(&self) -> bool { self.state() == LifecycleState::Running }

    /// Token cancelled as soon as draining begins.
    #[must_use]
    pub fn draining_token(&self) -> CancellationToken { self.0.draining.clone() }

    /// Token cancelled once the grace period ends and tracked sessions are
    /// told to stop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken { self.0.cancel_all.clone() }

    /// The error handed to callers refused in the current state.
    #[must_use]
    pub fn refusal(&self) -> ShutdownError { self.0.refuse() }

    fn register<V>(&self, map: &DashMap<u64, V>, value: V) -> Result<u64, ShutdownError> {
        if !self.is_running() {
            return Err(self.0.refuse());
        }
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        map.insert(id, value);
        // Draining may have started between the check and the insert.
        if !self.is_running() {
            map.remove(&id);
            return Err(self.0.refuse());
        }
        Ok(id)
    }

    /// Track a newly accepted connection.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] once draining has begun.
    pub fn track_connection(
        &self,
        peer: Option<SocketAddr>,
    ) -> Result<ConnectionGuard, ShutdownError> {
        let id = self.register(&self.0.connections, peer)?;
        crate::metrics::inc_connections();
        Ok(ConnectionGuard {
            inner: Arc::clone(&self.0),
            id,
        })
    }

    /// Track a stream about to start pushing events.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] once draining has begun.
    pub fn track_stream(&self) -> Result<StreamGuard, ShutdownError> {
        let token = self.0.cancel_all.child_token();
        let id = self.register(&self.0.streams, token.clone())?;
        crate::metrics::inc_streams();
        Ok(StreamGuard {
            inner: Arc::clone(&self.0),
            id,
            token,
        })
    }

    /// Register a callback to run after the drain, in registration order.
    ///
    /// A callback registered while cleanups are running, including by another
    /// callback, runs after the current batch.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] once the coordinator has stopped and cleanups
    /// have already run.
    pub fn on_cleanup<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<(), ShutdownError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let mut cleanups = self.0.cleanups();
        if self.state() == LifecycleState::Stopped {
            return Err(self.0.refuse());
        }
        cleanups.push((name.into(), Box::new(move || f().boxed())));
        Ok(())
    }

    /// Snapshot state and counts without waiting on the drain.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state(),
            connections: self.0.connections.len(),
            streams: self.0.streams.len(),
            pending_cleanups: self.0.cleanups().len(),
        }
    }

    /// Begin shutdown and return a future resolving once `stopped`.
    ///
    /// The drain runs on a spawned task, so it progresses even if the
    /// returned future is dropped. Calling this again while draining or after
    /// stopping returns the same completion.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime on the first call.
    pub fn shutdown(&self) -> ShutdownFuture {
        let mut slot = self.0.drain.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        self.0
            .state
            .store(LifecycleState::Draining as u8, Ordering::SeqCst);
        self.0.draining.cancel();

        let task = tokio::spawn(Arc::clone(&self.0).drain());
        let future = task
            .map(|joined| {
                joined.unwrap_or_else(|e| ShutdownReport {
                    forced: true,
                    remaining_streams: 0,
                    remaining_connections: 0,
                    cleanup_failures: vec![format!("drain task failed: {e}")],
                    elapsed: Duration::ZERO,
                })
            })
            .boxed()
            .shared();
        *slot = Some(future.clone());
        future
    }
}
