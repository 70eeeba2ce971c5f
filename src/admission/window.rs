//! Sliding-window request counter.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Admission timestamps within the trailing window.
///
/// Entries older than the window are evicted lazily whenever the window is
/// consulted, so memory is bounded by the request cap.
#[derive(Debug)]
pub(crate) struct RateWindow {
    limit: usize,
    length: Duration,
    admitted: VecDeque<Instant>,
}

/// Outcome of consulting the window at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WindowState {
    /// Admissions still allowed in the current window.
    pub remaining: usize,
    /// Time until the oldest admission leaves the window, or the full window
    /// length when the window is empty.
    pub reset_in: Duration,
}

impl RateWindow {
    pub(crate) fn new(limit: usize, length: Duration) -> Self {
        Self {
            limit,
            length,
            admitted: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    pub(crate) fn limit(&self) -> usize { self.limit }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.length {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evict stale admissions and report the allowance at `now`.
    pub(crate) fn state(&mut self, now: Instant) -> WindowState {
        self.evict(now);
        let reset_in = self.admitted.front().map_or(self.length, |oldest| {
            (*oldest + self.length).saturating_duration_since(now)
        });
        WindowState {
            remaining: self.limit.saturating_sub(self.admitted.len()),
            reset_in,
        }
    }

    /// Record an admission at `now`. Callers check [`Self::state`] first.
    pub(crate) fn record(&mut self, now: Instant) { self.admitted.push_back(now); }

    pub(crate) fn clear(&mut self) { self.admitted.clear(); }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize { self.admitted.len() }
}
