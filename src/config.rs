//! Environment-driven configuration.
//!
//! [`StreamConfig`] gathers the settings of every component. Each field
//! defaults to the component's own defaults; `STREAMKEEPER_*` variables
//! override individual knobs.

use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use crate::{
    admission::{AdmissionConfig, AdmissionConfigError},
    client::{BatchConfig, HeartbeatConfig, ReconnectConfig, SessionConfig},
    server::ServerConfig,
    shutdown::ShutdownConfig,
};

/// Prefix shared by all configuration variables.
pub const ENV_PREFIX: &str = "STREAMKEEPER_";

/// Errors raised while reading configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable holds a value that cannot be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// Full variable name.
        key: String,
        /// Offending raw value.
        value: String,
    },
    /// The admission limits are unusable.
    #[error(transparent)]
    Admission(#[from] AdmissionConfigError),
}

/// Settings for every component.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamConfig {
    /// Client reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Client stall detection.
    pub heartbeat: HeartbeatConfig,
    /// Client update coalescing.
    pub batch: BatchConfig,
    /// Server admission limits.
    pub admission: AdmissionConfig,
    /// Server drain timing.
    pub shutdown: ShutdownConfig,
    /// Server network and pacing settings.
    pub server: ServerConfig,
}

impl StreamConfig {
    /// Read overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable values or unusable admission
    /// limits.
    pub fn from_env() -> Result<Self, ConfigError> { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Read overrides through `lookup`, which maps a full variable name to
    /// its value.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use streamkeeper::config::StreamConfig;
    ///
    /// let cfg = StreamConfig::from_lookup(|key| {
    ///     (key == "STREAMKEEPER_BACKOFF_BASE_MS").then(|| "250".to_owned())
    /// })
    /// .expect("valid config");
    /// assert_eq!(cfg.reconnect.base_delay, Duration::from_millis(250));
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable values or unusable admission
    /// limits.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut cfg = Self::default();

        env.set("RECONNECT_MAX_ATTEMPTS", &mut cfg.reconnect.max_attempts)?;
        env.set("RECONNECT_ENABLED", &mut cfg.reconnect.enabled)?;
        env.set_millis("BACKOFF_BASE_MS", &mut cfg.reconnect.base_delay)?;
        env.set_millis("BACKOFF_MAX_MS", &mut cfg.reconnect.max_delay)?;
        env.set("JITTER_FACTOR", &mut cfg.reconnect.jitter)?;
        env.set_millis("HEARTBEAT_TIMEOUT_MS", &mut cfg.heartbeat.timeout)?;
        env.set_millis("BATCH_WINDOW_MS", &mut cfg.batch.window)?;
        env.set("BATCH_MAX_SIZE", &mut cfg.batch.max_size)?;

        env.set("QUEUE_MAX_SIZE", &mut cfg.admission.max_size)?;
        env.set("CONCURRENCY", &mut cfg.admission.concurrency)?;
        env.set("RATE_LIMIT_REQUESTS", &mut cfg.admission.rate_limit)?;
        env.set_millis("RATE_LIMIT_WINDOW_MS", &mut cfg.admission.rate_window)?;

        env.set_millis("SHUTDOWN_GRACE_MS", &mut cfg.shutdown.grace_period)?;
        env.set_millis("DRAIN_TIMEOUT_MS", &mut cfg.shutdown.drain_timeout)?;

        env.set::<SocketAddr>("BIND", &mut cfg.server.bind)?;
        env.set("WORKERS", &mut cfg.server.workers)?;
        env.set_millis("READ_TIMEOUT_MS", &mut cfg.server.read_timeout)?;
        env.set_millis("KEEP_ALIVE_MS", &mut cfg.server.keep_alive_interval)?;
        env.set_millis("QUEUED_NOTICE_MS", &mut cfg.server.queued_notice_interval)?;
        if let Some(rate) = env.parse::<usize>("EVENTS_PER_SECOND")? {
            cfg.server.events_per_second = Some(rate);
        }

        cfg.admission.validate()?;
        Ok(cfg.normalized())
    }

    /// Apply every component's clamping rules.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            reconnect: self.reconnect.normalized(),
            heartbeat: self.heartbeat.normalized(),
            batch: self.batch.normalized(),
            admission: self.admission,
            shutdown: self.shutdown.normalized(),
            server: self.server.normalized(),
        }
    }

    /// Client-side settings for [`Session::spawn`](crate::client::Session::spawn).
    #[must_use]
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            reconnect: self.reconnect,
            heartbeat: self.heartbeat,
            batch: self.batch,
        }
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        let key = format!("{ENV_PREFIX}{name}");
        let Some(raw) = (self.0)(&key) else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw })
    }

    fn set<T: FromStr>(&self, name: &str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.parse(name)? {
            *slot = value;
        }
        Ok(())
    }

    fn set_millis(&self, name: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.parse::<u64>(name)? {
            *slot = Duration::from_millis(ms);
        }
        Ok(())
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reconnect(max_attempts={}, base={:?}, max={:?}, jitter={}) heartbeat={:?} \
             batch(window={:?}, max={}) admission(queue={}, concurrency={}, rate={}/{:?}) \
             shutdown(grace={:?}, drain={:?}) bind={}",
            self.reconnect.max_attempts,
            self.reconnect.base_delay,
            self.reconnect.max_delay,
            self.reconnect.jitter,
            self.heartbeat.timeout,
            self.batch.window,
            self.batch.max_size,
            self.admission.max_size,
            self.admission.concurrency,
            self.admission.rate_limit,
            self.admission.rate_window,
            self.shutdown.grace_period,
            self.shutdown.drain_timeout,
            self.server.bind,
        )
    }
}
