//! Shared helpers for integration tests.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use streamkeeper::{
    SessionHandle,
    SessionUpdate,
    ShutdownReport,
    StreamServer,
    server::{ServerError, Unbound},
};
use tokio::{sync::oneshot, task::JoinHandle};

/// Result type used by fallible tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Create a TCP listener bound to a free local port.
///
/// # Errors
///
/// Returns any IO error encountered while binding to an ephemeral localhost
/// port.
///
/// # Examples
///
/// ```rust,no_run
/// use streamkeeper_testing::{TestResult, unused_listener};
///
/// fn example() -> TestResult {
///     let listener = unused_listener()?;
///     let addr = listener.local_addr()?;
///     assert!(addr.port() > 0);
///     Ok(())
/// }
/// ```
pub fn unused_listener() -> std::io::Result<StdTcpListener> {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr)
}

/// Bind `server` to a free port and run it until the returned sender fires.
///
/// Resolves once the server signalled readiness.
///
/// # Errors
///
/// Returns an error if binding fails or the server exits before becoming
/// ready.
pub async fn spawn_server(
    server: StreamServer<Unbound>,
) -> TestResult<(
    SocketAddr,
    oneshot::Sender<()>,
    JoinHandle<Result<ShutdownReport, ServerError>>,
)> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let server = server
        .ready_signal(ready_tx)
        .bind_existing_listener(unused_listener()?)?;
    let addr = server.local_addr().ok_or("bound server has no address")?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));
    ready_rx.await?;
    Ok((addr, stop_tx, handle))
}

/// Receive updates until the session's terminal notification.
pub async fn collect_updates(mut handle: SessionHandle) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();
    while let Some(update) = handle.next_update().await {
        let terminal = update.is_terminal();
        updates.push(update);
        if terminal {
            break;
        }
    }
    updates
}

/// Ids of every data item delivered in `updates`, in delivery order.
pub fn delivered_ids(updates: &[SessionUpdate]) -> Vec<String> {
    updates
        .iter()
        .filter_map(|update| match update {
            SessionUpdate::Items(items) => Some(items),
            _ => None,
        })
        .flatten()
        .map(|event| event.id.to_string())
        .collect()
}
