//! Worker loops accepting push connections.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::backoff::{AcceptBackoff, BackoffConfig};
use crate::server::connection::{ConnectionContext, spawn_connection_task};

/// Where a worker takes new connections from.
///
/// Dropping a pending `accept()` future must not lose a connection.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

pub(in crate::server) struct AcceptLoopOptions {
    pub context: ConnectionContext,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: BackoffConfig,
}

/// Accept connections until `shutdown` fires, handing each to a tracked
/// connection task.
///
/// Accept errors pause the worker per [`BackoffConfig`]; the pause itself
/// ends early on shutdown.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(in crate::server) async fn accept_loop<L>(listener: Arc<L>, options: AcceptLoopOptions)
where
    L: AcceptListener + Send + Sync + 'static,
{
    let AcceptLoopOptions {
        context,
        shutdown,
        tracker,
        backoff,
    } = options;
    let mut backoff = AcceptBackoff::new(backoff);

    loop {
        let accepted = select! {
            biased;

            () = shutdown.cancelled() => return,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                backoff.succeeded();
                debug!("connection accepted: peer_addr={peer_addr}");
                spawn_connection_task(stream, context.clone(), &tracker);
            }
            Err(e) => {
                let delay = backoff.failed();
                let local_addr = listener.local_addr().ok();
                warn!(
                    "accept error: error={e:?}, local_addr={local_addr:?}, failures={}, \
                     retry_in={delay:?}",
                    backoff.failures()
                );
                select! {
                    biased;

                    () = shutdown.cancelled() => return,
                    () = sleep(delay) => {}
                }
            }
        }
    }
}
