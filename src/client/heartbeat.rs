//! Inbound-activity watchdog.

use std::{pin::Pin, time::Duration};

use tokio::time::{Instant, Sleep, sleep};

/// Heartbeat settings.
///
/// # Default Values
/// - `timeout`: 30 seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Silence after which a connection is treated as stalled.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Keep the timeout at or above one millisecond.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.timeout = self.timeout.max(Duration::from_millis(1));
        self
    }
}

/// Declares a connection stalled when no activity arrives in time.
///
/// The monitor starts disarmed. [`beat`](Self::beat) arms it and pushes the
/// deadline out; [`expired`](Self::expired) resolves once per armed period and
/// then disarms, so a stall is reported exactly once until the next beat.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    armed: bool,
}

impl HeartbeatMonitor {
    /// Create a disarmed monitor.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let timeout = config.normalized().timeout;
        Self {
            timeout,
            deadline: Box::pin(sleep(timeout)),
            armed: false,
        }
    }

    /// Record inbound activity and restart the timer.
    pub fn beat(&mut self) {
        self.deadline.as_mut().reset(Instant::now() + self.timeout);
        self.armed = true;
    }

    /// Disarm the timer so nothing fires after teardown.
    pub fn stop(&mut self) { self.armed = false; }

    /// Returns `true` while a stall can still be reported.
    #[must_use]
    pub fn is_armed(&self) -> bool { self.armed }

    /// Resolve when the armed timer elapses; pending forever while disarmed.
    ///
    /// Cancel safe: dropping the future keeps the deadline.
    pub async fn expired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.deadline.as_mut().await;
        self.armed = false;
    }
}
