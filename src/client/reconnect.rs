//! Bounded exponential back-off for session reconnects.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnect policy.
///
/// # Default Values
/// - `enabled`: `true`
/// - `max_attempts`: 3 consecutive reconnect attempts
/// - `base_delay`: 100 milliseconds
/// - `max_delay`: 5 seconds
/// - `jitter`: 0.3 (±30% applied multiplicatively)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectConfig {
    /// Whether dropped connections are retried at all.
    pub enabled: bool,
    /// Reconnect attempts allowed between successful opens.
    pub max_attempts: u32,
    /// Delay before the first reconnect, doubled for each further attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Symmetric jitter fraction in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.3,
        }
    }
}

impl ReconnectConfig {
    /// Clamp the jitter into `0.0..=1.0`, replacing NaN with zero, and raise
    /// `max_delay` to at least `base_delay`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        self.max_delay = self.max_delay.max(self.base_delay);
        self
    }

    /// Un-jittered delay for the zero-based `attempt`:
    /// `min(2^attempt * base_delay, max_delay)`.
    #[must_use]
    pub fn center_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay for `attempt` with jitter `unit` in `-1.0..=1.0` applied.
    ///
    /// The result always lies within `0..=max_delay`.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let center = self.center_delay(attempt);
        let spread = self.jitter * unit.clamp(-1.0, 1.0);
        if spread.abs() < f64::EPSILON {
            return center;
        }
        let secs = (center.as_secs_f64() * (1.0 + spread)).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

/// Returned when no further reconnect is allowed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("reconnect attempts exhausted after {attempts}")]
pub struct RetriesExhausted {
    /// Attempts made since the last successful open.
    pub attempts: u32,
    /// Last recorded failure, if any.
    pub last_error: Option<String>,
}

/// Per-session reconnect bookkeeping.
///
/// Owned by a single session task; none of the methods synchronize.
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    attempt: u32,
    last_error: Option<String>,
    completed: bool,
}

impl ReconnectManager {
    /// Create a manager for a fresh session.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config: config.normalized(),
            attempt: 0,
            last_error: None,
            completed: false,
        }
    }

    /// Active policy.
    #[must_use]
    pub fn config(&self) -> &ReconnectConfig { &self.config }

    /// Reconnect attempts made since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 { self.attempt }

    /// Most recent failure recorded with [`Self::record_error`].
    #[must_use]
    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }

    /// Returns `true` when retries are enabled and the attempt cap is not
    /// yet reached.
    #[must_use]
    pub fn should_retry(&self) -> bool { self.config.enabled && self.attempt < self.config.max_attempts }

    /// Draw the jittered delay for the next attempt without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`RetriesExhausted`] when [`Self::should_retry`] is `false`.
    pub fn next_delay(&self) -> Result<Duration, RetriesExhausted> {
        if !self.should_retry() {
            return Err(self.exhausted());
        }
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        Ok(self.config.jittered_delay(self.attempt, unit))
    }

    /// Count one reconnect attempt as made. Returns the new attempt count.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempt += 1;
        crate::metrics::inc_reconnects();
        self.attempt
    }

    /// Wait out the back-off delay, then count the attempt.
    ///
    /// Dropping the returned future before the delay elapses leaves the
    /// attempt counter unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RetriesExhausted`] immediately when no retry is allowed.
    pub async fn schedule_retry(&mut self) -> Result<u32, RetriesExhausted> {
        let delay = self.next_delay()?;
        debug!(attempt = self.attempt + 1, ?delay, "reconnect scheduled");
        sleep(delay).await;
        Ok(self.record_attempt())
    }

    /// Clear the attempt counter and last error after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_error = None;
    }

    /// Remember `error` for diagnostics. Does not schedule anything.
    pub fn record_error(&mut self, error: impl Into<String>) { self.last_error = Some(error.into()); }

    /// Claim the single terminal notification for this session.
    ///
    /// Returns `true` only on the first call.
    pub fn mark_completed(&mut self) -> bool { !std::mem::replace(&mut self.completed, true) }

    /// Reset everything, including the completion guard, for a new session.
    pub fn restart(&mut self) {
        self.reset();
        self.completed = false;
    }

    fn exhausted(&self) -> RetriesExhausted {
        RetriesExhausted {
            attempts: self.attempt,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;
    use tokio::time::Instant;

    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            jitter: 0.0,
            ..ReconnectConfig::default()
        }
    }

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(5, 3200)]
    #[case(6, 5000)]
    #[case(40, 5000)]
    fn center_delay_doubles_up_to_cap(#[case] attempt: u32, #[case] millis: u64) {
        let config = ReconnectConfig::default();
        assert_eq!(config.center_delay(attempt), Duration::from_millis(millis));
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(diff < Duration::from_micros(1), "{actual:?} != {expected:?}");
    }

    #[test]
    fn jitter_extremes_scale_the_center() {
        let config = ReconnectConfig::default();
        assert_close(config.jittered_delay(0, -1.0), Duration::from_millis(70));
        assert_close(config.jittered_delay(0, 1.0), Duration::from_millis(130));
        assert_close(config.jittered_delay(10, 1.0), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_retry_counts_after_the_delay() {
        let mut manager = ReconnectManager::new(no_jitter(3));
        let started = Instant::now();
        assert_eq!(manager.schedule_retry().await, Ok(1));
        assert_eq!(manager.schedule_retry().await, Ok(2));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_schedule_leaves_counter_untouched() {
        let mut manager = ReconnectManager::new(no_jitter(3));
        let pending = tokio::time::timeout(Duration::from_millis(50), manager.schedule_retry()).await;
        assert!(pending.is_err());
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_manager_rejects_immediately() {
        let mut manager = ReconnectManager::new(no_jitter(1));
        manager.record_error("reset by peer");
        manager.schedule_retry().await.expect("first retry allowed");
        let started = Instant::now();
        let err = manager.schedule_retry().await.expect_err("cap reached");
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.last_error.as_deref(), Some("reset by peer"));

        manager.reset();
        assert!(manager.should_retry());
        assert_eq!(manager.last_error(), None);
    }

    #[test]
    fn disabled_policy_never_retries() {
        let manager = ReconnectManager::new(ReconnectConfig {
            enabled: false,
            ..ReconnectConfig::default()
        });
        assert!(!manager.should_retry());
    }

    #[test]
    fn completion_guard_fires_once_until_restart() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        assert!(manager.mark_completed());
        assert!(!manager.mark_completed());
        assert!(!manager.mark_completed());
        manager.restart();
        assert!(manager.mark_completed());
    }

    #[rstest]
    #[case(f64::NAN, 0.0)]
    #[case(-0.5, 0.0)]
    #[case(7.0, 1.0)]
    fn normalized_clamps_jitter(#[case] jitter: f64, #[case] expected: f64) {
        let config = ReconnectConfig {
            jitter,
            ..ReconnectConfig::default()
        }
        .normalized();
        assert!((config.jitter - expected).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn delays_stay_within_bounds(
            attempt in 0u32..3,
            unit in -1.0f64..=1.0,
            jitter in 0.0f64..=1.0,
        ) {
            let config = ReconnectConfig { jitter, ..ReconnectConfig::default() };
            let delay = config.jittered_delay(attempt, unit);
            prop_assert!(delay <= config.max_delay);
            let center = config.center_delay(attempt);
            prop_assert_eq!(center, (config.base_delay * 2u32.pow(attempt)).min(config.max_delay));
            let spread = center.as_secs_f64() * jitter;
            prop_assert!((delay.as_secs_f64() - center.as_secs_f64()).abs() <= spread + 1e-6);
        }
    }
}
