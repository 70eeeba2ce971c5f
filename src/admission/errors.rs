//! Rejection types returned by admission control.
//!
//! Every rejection carries the facts a caller needs to retry correctly: the
//! configured limit, the allowance remaining when the request was refused,
//! and when the refusing condition is expected to clear.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::time::Instant;

/// Retry guidance attached to every admission rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// Configured limit that was hit (queue size, request cap, or zero while
    /// shutting down).
    pub limit: usize,
    /// Allowance left at the moment of rejection.
    pub remaining: usize,
    /// How long the caller should wait before retrying.
    pub retry_after: Duration,
    /// When the refusing condition is expected to clear.
    pub reset_at: Instant,
}

impl Rejection {
    /// Build a rejection whose reset time is `retry_after` from `now`.
    #[must_use]
    pub fn new(limit: usize, remaining: usize, retry_after: Duration, now: Instant) -> Self {
        Self {
            limit,
            remaining,
            retry_after,
            reset_at: now + retry_after,
        }
    }

    /// `retry_after` rounded up to whole seconds, as used by `Retry-After`.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 { secs + 1 } else { secs }
    }

    /// Reset time as whole seconds since the Unix epoch, rounded up.
    #[must_use]
    pub fn reset_unix_secs(&self) -> u64 {
        let until_reset = self.reset_at.saturating_duration_since(Instant::now());
        let reset = SystemTime::now() + until_reset;
        let since_epoch = reset.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = since_epoch.as_secs();
        if since_epoch.subsec_nanos() > 0 { secs + 1 } else { secs }
    }
}

/// Reasons a request was not admitted.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The pending queue is at its configured capacity.
    ///
    /// The attached [`Rejection`] still describes the rate window so callers
    /// see the same limit headers on every refusal.
    #[error("admission queue full (max {max_size}); retry after {:?}", .rejection.retry_after)]
    QueueFull {
        /// Configured maximum number of pending entries.
        max_size: usize,
        /// Retry guidance.
        rejection: Rejection,
    },
    /// The sliding-window request cap has been reached.
    #[error("rate limited ({} per window); retry after {:?}", .0.limit, .0.retry_after)]
    RateLimited(Rejection),
    /// The server is draining and refuses new sessions.
    #[error("server shutting down; retry after {:?}", .0.retry_after)]
    ShuttingDown(Rejection),
}

impl AdmissionError {
    /// Retry guidance carried by this rejection.
    #[must_use]
    pub fn rejection(&self) -> &Rejection {
        match self {
            Self::QueueFull { rejection, .. } => rejection,
            Self::RateLimited(r) | Self::ShuttingDown(r) => r,
        }
    }

    /// Machine-readable reason code.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::RateLimited(_) => "rate_limited",
            Self::ShuttingDown(_) => "shutting_down",
        }
    }

    /// Rebuild an error from its reason code, as received from a peer.
    ///
    /// `max_size` is only used for `queue_full`.
    #[must_use]
    pub fn from_reason(reason: &str, max_size: usize, rejection: Rejection) -> Option<Self> {
        match reason {
            "queue_full" => Some(Self::QueueFull {
                max_size,
                rejection,
            }),
            "rate_limited" => Some(Self::RateLimited(rejection)),
            "shutting_down" => Some(Self::ShuttingDown(rejection)),
            _ => None,
        }
    }
}

/// Errors returned when creating an admission queue.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionConfigError {
    /// A capacity, concurrency, or request cap of zero.
    #[error("invalid admission limit `{name}`: must be >= 1")]
    ZeroLimit {
        /// Name of the offending setting.
        name: &'static str,
    },
    /// A rate window of zero length.
    #[error("rate window must be longer than zero")]
    ZeroWindow,
}
