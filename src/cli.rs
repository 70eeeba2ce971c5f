//! Command line interface for the `streamkeeper` binary.
//!
//! Every tuning flag can also be set through the matching `STREAMKEEPER_*`
//! environment variable. Flags left unset fall back to the environment and
//! then to the library defaults.

use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

/// Command line arguments for the `streamkeeper` binary.
#[derive(Debug, Parser)]
#[command(
    name = "streamkeeper",
    version,
    about = "Resumable event streams with admission control and graceful drain"
)]
pub struct Cli {
    /// Action to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve a replayed scenario to resuming clients.
    Serve(ServeArgs),
    /// Follow one session and print its updates.
    Watch(WatchArgs),
}

/// Options for `serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "STREAMKEEPER_BIND")]
    pub bind: Option<SocketAddr>,
    /// JSON file holding the event script; a built-in demo is used otherwise.
    #[arg(long)]
    pub scenario: Option<PathBuf>,
    /// Delay before each replayed event, in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub interval_ms: u64,
    /// Cap on events written per second on each stream.
    #[arg(long, env = "STREAMKEEPER_EVENTS_PER_SECOND")]
    pub events_per_second: Option<usize>,
    /// Maximum number of queued sessions.
    #[arg(long, env = "STREAMKEEPER_QUEUE_MAX_SIZE")]
    pub queue_max_size: Option<usize>,
    /// Sessions streaming at once.
    #[arg(long, env = "STREAMKEEPER_CONCURRENCY")]
    pub concurrency: Option<usize>,
    /// Admissions allowed per rate window.
    #[arg(long, env = "STREAMKEEPER_RATE_LIMIT_REQUESTS")]
    pub rate_limit_requests: Option<usize>,
    /// Length of the rate window, in milliseconds.
    #[arg(long, env = "STREAMKEEPER_RATE_LIMIT_WINDOW_MS")]
    pub rate_limit_window_ms: Option<u64>,
    /// Pause before cancelling streams on shutdown, in milliseconds.
    #[arg(long, env = "STREAMKEEPER_SHUTDOWN_GRACE_MS")]
    pub shutdown_grace_ms: Option<u64>,
    /// Hard bound on draining, in milliseconds.
    #[arg(long, env = "STREAMKEEPER_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: Option<u64>,
    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "STREAMKEEPER_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Options for `watch`.
#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1:7878")]
    pub addr: SocketAddr,
    /// Session to follow.
    #[arg(long, default_value = "demo")]
    pub session: String,
    /// Consecutive reconnect attempts before giving up.
    #[arg(long, env = "STREAMKEEPER_RECONNECT_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,
    /// First reconnect delay, in milliseconds.
    #[arg(long, env = "STREAMKEEPER_BACKOFF_BASE_MS")]
    pub backoff_base_ms: Option<u64>,
    /// Largest reconnect delay, in milliseconds.
    #[arg(long, env = "STREAMKEEPER_BACKOFF_MAX_MS")]
    pub backoff_max_ms: Option<u64>,
    /// Relative jitter applied to reconnect delays, between 0 and 1.
    #[arg(long, env = "STREAMKEEPER_JITTER_FACTOR")]
    pub jitter: Option<f64>,
    /// Silence tolerated before a connection counts as stalled, in milliseconds.
    #[arg(long, env = "STREAMKEEPER_HEARTBEAT_TIMEOUT_MS")]
    pub heartbeat_timeout_ms: Option<u64>,
    /// Batch window for data items, in milliseconds.
    #[arg(long, env = "STREAMKEEPER_BATCH_WINDOW_MS")]
    pub batch_window_ms: Option<u64>,
    /// Items kept per batch.
    #[arg(long, env = "STREAMKEEPER_BATCH_MAX_SIZE")]
    pub batch_max_size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn parses_serve_options() {
        let cli = Cli::parse_from([
            "streamkeeper",
            "serve",
            "--bind",
            "127.0.0.1:9000",
            "--concurrency",
            "4",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind, Some("127.0.0.1:9000".parse().expect("addr")));
        assert_eq!(args.concurrency, Some(4));
        assert_eq!(args.interval_ms, 200);
    }

    #[test]
    fn parses_watch_options() {
        let cli = Cli::parse_from(["streamkeeper", "watch", "--session", "abc", "--jitter", "0.5"]);
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.session, "abc");
        assert_eq!(args.jitter, Some(0.5));
        assert_eq!(args.addr.port(), 7878);
    }
}
