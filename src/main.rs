//! `streamkeeper` binary: serve a replayed scenario or watch a session.

mod cli;

use std::{error::Error, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use cli::{Cli, Command, ServeArgs, WatchArgs};
use streamkeeper::{
    Event,
    EventKind,
    ReplaySource,
    Session,
    SessionUpdate,
    ShutdownCoordinator,
    StreamConfig,
    StreamServer,
    TcpTransport,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let result = match StreamConfig::from_env() {
        Ok(config) => match cli.command {
            Command::Serve(args) => serve(config, args).await,
            Command::Watch(args) => watch(config, args).await,
        },
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "streamkeeper failed");
            ExitCode::FAILURE
        }
    }
}

fn demo_script() -> Vec<Event> {
    let mut script = vec![Event::new(1u64, EventKind::Status, "analysis started")];
    script.extend((2u64..=21).map(|id| Event::data(id, format!("finding #{}", id - 1))));
    script.push(Event::new(22u64, EventKind::Cost, r#"{"tokens":4210}"#));
    script.push(Event::new(23u64, EventKind::Done, ""));
    script
}

fn apply_serve_args(config: &mut StreamConfig, args: &ServeArgs) {
    let millis = Duration::from_millis;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.events_per_second.is_some() {
        config.server.events_per_second = args.events_per_second;
    }
    if let Some(value) = args.queue_max_size {
        config.admission.max_size = value;
    }
    if let Some(value) = args.concurrency {
        config.admission.concurrency = value;
    }
    if let Some(value) = args.rate_limit_requests {
        config.admission.rate_limit = value;
    }
    if let Some(ms) = args.rate_limit_window_ms {
        config.admission.rate_window = millis(ms);
    }
    if let Some(ms) = args.shutdown_grace_ms {
        config.shutdown.grace_period = millis(ms);
    }
    if let Some(ms) = args.drain_timeout_ms {
        config.shutdown.drain_timeout = millis(ms);
    }
    *config = config.normalized();
}

fn apply_watch_args(config: &mut StreamConfig, args: &WatchArgs) {
    let millis = Duration::from_millis;
    if let Some(value) = args.max_attempts {
        config.reconnect.max_attempts = value;
    }
    if let Some(ms) = args.backoff_base_ms {
        config.reconnect.base_delay = millis(ms);
    }
    if let Some(ms) = args.backoff_max_ms {
        config.reconnect.max_delay = millis(ms);
    }
    if let Some(value) = args.jitter {
        config.reconnect.jitter = value;
    }
    if let Some(ms) = args.heartbeat_timeout_ms {
        config.heartbeat.timeout = millis(ms);
    }
    if let Some(ms) = args.batch_window_ms {
        config.batch.window = millis(ms);
    }
    if let Some(value) = args.batch_max_size {
        config.batch.max_size = value;
    }
    *config = config.normalized();
}

#[cfg(feature = "metrics")]
fn install_metrics(addr: Option<std::net::SocketAddr>) -> Result<(), BoxError> {
    if let Some(addr) = addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "prometheus exporter listening");
    }
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics(addr: Option<std::net::SocketAddr>) -> Result<(), BoxError> {
    if addr.is_some() {
        warn!("built without the `metrics` feature; ignoring --metrics-addr");
    }
    Ok(())
}

async fn serve(mut config: StreamConfig, args: ServeArgs) -> Result<ExitCode, BoxError> {
    apply_serve_args(&mut config, &args);
    install_metrics(args.metrics_addr)?;
    info!(%config, "starting server");

    let source = match &args.scenario {
        Some(path) => ReplaySource::from_json_file(path)?,
        None => ReplaySource::new(demo_script()),
    }
    .interval(Duration::from_millis(args.interval_ms));

    let server = StreamServer::new(source)
        .config(config.server)
        .admission(config.admission)
        .shutdown_coordinator(ShutdownCoordinator::new(config.shutdown))
        .bind(None)?;
    let report = server.run().await?;
    for failure in &report.cleanup_failures {
        warn!(%failure, "cleanup failed");
    }
    Ok(if report.forced {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn render(update: &SessionUpdate) -> String {
    match update {
        SessionUpdate::Items(items) => items
            .iter()
            .map(|event| format!("[{}] {}", event.id, event.payload))
            .collect::<Vec<_>>()
            .join("\n"),
        SessionUpdate::Status(event) => format!("status: {}", event.payload),
        SessionUpdate::Cost(event) => format!("cost: {}", event.payload),
        SessionUpdate::Resumed => "-- resumed --".to_owned(),
        SessionUpdate::Reconnecting { attempt, delay } => {
            format!("-- reconnecting (attempt {attempt}) in {delay:?} --")
        }
        other => format!("{other:?}"),
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn watch(mut config: StreamConfig, args: WatchArgs) -> Result<ExitCode, BoxError> {
    apply_watch_args(&mut config, &args);
    let transport = Arc::new(TcpTransport::new(args.addr));
    let mut handle = Session::spawn(transport, config.session(), args.session);

    let mut success = false;
    loop {
        let update = tokio::select! {
            update = handle.next_update() => update,
            _ = signal::ctrl_c() => {
                handle.cancel();
                continue;
            }
        };
        let Some(update) = update else { break };
        println!("{}", render(&update));
        if update.is_terminal() {
            success = matches!(update, SessionUpdate::Done);
        }
    }
    handle.join().await?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
