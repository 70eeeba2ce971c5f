//! Retry pacing for failed `accept()` calls.

use std::time::Duration;

/// Exponential back-off applied when the listener fails to accept.
///
/// The first retry waits `initial_delay`; each consecutive failure doubles
/// the wait up to `max_delay`. A successful accept starts over.
///
/// ```
/// use std::time::Duration;
///
/// use streamkeeper::server::BackoffConfig;
///
/// let cfg = BackoffConfig {
///     initial_delay: Duration::from_millis(5),
///     max_delay: Duration::ZERO,
/// }
/// .normalized();
/// assert_eq!(cfg.initial_delay, Duration::from_millis(1));
/// assert_eq!(cfg.max_delay, Duration::from_millis(5));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Wait after the first failure in a run.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Raise both delays to at least 1 ms and order them.
    #[must_use]
    pub fn normalized(self) -> Self {
        let floor = Duration::from_millis(1);
        let (a, b) = (self.initial_delay.max(floor), self.max_delay.max(floor));
        Self {
            initial_delay: a.min(b),
            max_delay: a.max(b),
        }
    }
}

/// Back-off state owned by one accept loop.
#[derive(Debug)]
pub(super) struct AcceptBackoff {
    config: BackoffConfig,
    next: Duration,
    failures: u32,
}

impl AcceptBackoff {
    pub(super) fn new(config: BackoffConfig) -> Self {
        let config = config.normalized();
        Self {
            config,
            next: config.initial_delay,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before accepting again.
    pub(super) fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.failures = self.failures.saturating_add(1);
        self.next = delay.saturating_mul(2).min(self.config.max_delay);
        delay
    }

    pub(super) fn succeeded(&mut self) {
        self.next = self.config.initial_delay;
        self.failures = 0;
    }

    /// Consecutive failures since the last successful accept.
    pub(super) fn failures(&self) -> u32 { self.failures }
}
