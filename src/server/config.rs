//! Configuration for [`StreamServer`].

use std::{
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use tokio::sync::oneshot;

use super::{BackoffConfig, ScenarioSource, StreamServer, Unbound};
use crate::{admission::AdmissionConfig, codec::DEFAULT_FRAME_LENGTH, shutdown::ShutdownCoordinator};

pub mod binding;

/// Upper bound for [`ServerConfig::events_per_second`].
pub const MAX_EVENT_RATE: usize = 10_000;

/// Network and pacing settings for a [`StreamServer`].
///
/// # Default Values
/// - `bind`: `127.0.0.1:7878`
/// - `workers`: available CPU cores, or 1
/// - `read_timeout`: 10 seconds for the open request
/// - `keep_alive_interval`: 15 seconds of idle time between `:` comments
/// - `queued_notice_interval`: 1 second between notices to queued clients
/// - `events_per_second`: unlimited
/// - `max_frame_length`: [`DEFAULT_FRAME_LENGTH`]
/// - `accept_backoff`: [`BackoffConfig::default`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind: SocketAddr,
    /// Number of accept loops sharing the listener.
    pub workers: usize,
    /// Time allowed for a client to send its open request.
    pub read_timeout: Duration,
    /// Idle time after which a keep-alive comment is written.
    pub keep_alive_interval: Duration,
    /// Time between `: queued` comments sent before the response head.
    ///
    /// Keep it below the clients' connect timeout.
    pub queued_notice_interval: Duration,
    /// Optional cap on events written per second on each stream.
    pub events_per_second: Option<usize>,
    /// Largest encoded event accepted by the codec.
    pub max_frame_length: usize,
    /// Back-off applied when `accept()` fails.
    pub accept_backoff: BackoffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 7878),
            workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            read_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(15),
            queued_notice_interval: Duration::from_secs(1),
            events_per_second: None,
            max_frame_length: DEFAULT_FRAME_LENGTH,
            accept_backoff: BackoffConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Clamp settings to workable values.
    ///
    /// Zero workers becomes one, zero durations become one millisecond, a
    /// zero event rate disables pacing and larger rates are capped at
    /// [`MAX_EVENT_RATE`].
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.workers = self.workers.max(1);
        self.read_timeout = self.read_timeout.max(Duration::from_millis(1));
        self.keep_alive_interval = self.keep_alive_interval.max(Duration::from_millis(1));
        self.queued_notice_interval = self.queued_notice_interval.max(Duration::from_millis(1));
        self.events_per_second = self
            .events_per_second
            .filter(|rate| *rate > 0)
            .map(|rate| rate.min(MAX_EVENT_RATE));
        self.accept_backoff = self.accept_backoff.normalized();
        self
    }
}

impl StreamServer<Unbound> {
    /// Create an unbound server streaming events from `source`.
    ///
    /// Settings start at their defaults; call [`bind`](Self::bind) before
    /// running the server.
    #[must_use]
    pub fn new(source: impl ScenarioSource) -> Self {
        Self {
            source: Arc::new(source),
            config: ServerConfig::default(),
            admission: AdmissionConfig::default(),
            coordinator: ShutdownCoordinator::default(),
            ready_tx: None,
            state: Unbound,
        }
    }

    /// Replace the network and pacing settings.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Replace the admission limits. They are validated when binding.
    #[must_use]
    pub fn admission(mut self, config: AdmissionConfig) -> Self {
        self.admission = config;
        self
    }

    /// Use `coordinator` to track connections and streams.
    #[must_use]
    pub fn shutdown_coordinator(mut self, coordinator: ShutdownCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Configure a channel used to signal when the server is ready to accept
    /// connections.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// Returns `None` as the server is not bound.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> { None }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some(0), None)]
    #[case(Some(5), Some(5))]
    #[case(Some(MAX_EVENT_RATE * 2), Some(MAX_EVENT_RATE))]
    #[case(None, None)]
    fn event_rate_is_clamped(#[case] input: Option<usize>, #[case] expected: Option<usize>) {
        let cfg = ServerConfig {
            events_per_second: input,
            ..ServerConfig::default()
        }
        .normalized();
        assert_eq!(cfg.events_per_second, expected);
    }

    #[test]
    fn zero_values_are_raised() {
        let cfg = ServerConfig {
            workers: 0,
            read_timeout: Duration::ZERO,
            keep_alive_interval: Duration::ZERO,
            queued_notice_interval: Duration::ZERO,
            ..ServerConfig::default()
        }
        .normalized();
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.read_timeout, Duration::from_millis(1));
        assert_eq!(cfg.keep_alive_interval, Duration::from_millis(1));
        assert_eq!(cfg.queued_notice_interval, Duration::from_millis(1));
    }
}
