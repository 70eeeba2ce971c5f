//! Metric helpers for `streamkeeper`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. With the
//! `metrics` feature disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open server-side connections.
pub const CONNECTIONS_ACTIVE: &str = "streamkeeper_connections_active";
/// Name of the gauge tracking streams currently pushing events.
pub const STREAMS_ACTIVE: &str = "streamkeeper_streams_active";
/// Name of the counter tracking events handed to consumers or peers.
pub const EVENTS_DELIVERED: &str = "streamkeeper_events_delivered_total";
/// Name of the counter tracking replayed events dropped as duplicates.
pub const DUPLICATES_DROPPED: &str = "streamkeeper_duplicates_dropped_total";
/// Name of the counter tracking reconnect attempts.
pub const RECONNECTS_TOTAL: &str = "streamkeeper_reconnects_total";
/// Name of the counter tracking admission rejections.
pub const REJECTIONS_TOTAL: &str = "streamkeeper_rejections_total";

/// Side of the stream an event was counted on.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Events received by a client session.
    Inbound,
    /// Events written to a peer by the server.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Increment the active streams gauge.
pub fn inc_streams() {
    #[cfg(feature = "metrics")]
    gauge!(STREAMS_ACTIVE).increment(1.0);
}

/// Decrement the active streams gauge.
pub fn dec_streams() {
    #[cfg(feature = "metrics")]
    gauge!(STREAMS_ACTIVE).decrement(1.0);
}

/// Record `count` delivered events for the given direction.
pub fn add_events(direction: Direction, count: u64) {
    #[cfg(feature = "metrics")]
    counter!(EVENTS_DELIVERED, "direction" => direction.as_str()).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, count);
}

/// Record a duplicate event dropped by the resume layer.
pub fn inc_duplicates() {
    #[cfg(feature = "metrics")]
    counter!(DUPLICATES_DROPPED).increment(1);
}

/// Record a reconnect attempt.
pub fn inc_reconnects() {
    #[cfg(feature = "metrics")]
    counter!(RECONNECTS_TOTAL).increment(1);
}

/// Record an admission rejection labelled with its reason.
pub fn inc_rejections(reason: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(REJECTIONS_TOTAL, "reason" => reason).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}
