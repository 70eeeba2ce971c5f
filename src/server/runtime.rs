//! Runtime control for [`StreamServer`].

mod accept;
mod backoff;
#[cfg(test)]
mod tests;

use std::sync::Arc;

#[cfg(test)]
pub(super) use accept::MockAcceptListener;
pub(super) use accept::{AcceptLoopOptions, accept_loop};
pub use backoff::BackoffConfig;
use futures::Future;
use log::{info, warn};
use tokio::{select, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    Bound,
    ServerError,
    StreamServer,
    connection::ConnectionContext,
    dispatch::dispatch,
};
use crate::shutdown::ShutdownReport;

impl StreamServer<Bound> {
    /// Run the server until Ctrl+C, then drain.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use streamkeeper::server::{ReplaySource, StreamServer};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), streamkeeper::server::ServerError> {
    /// let server = StreamServer::new(ReplaySource::default()).bind(None)?;
    /// let report = server.run().await?;
    /// assert!(!report.forced);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Accept failures are retried with exponential back-off and do not
    /// surface as errors; the signature leaves room for fatal runtime errors.
    pub async fn run(self) -> Result<ShutdownReport, ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run the server until the `shutdown` future resolves, then drain.
    ///
    /// Accepting stops as soon as `shutdown` resolves. Queued sessions are
    /// refused, streaming sessions are cancelled after the coordinator's
    /// grace period, and the returned report says whether the drain timeout
    /// forced the exit.
    ///
    /// # Errors
    ///
    /// Accept failures are retried with exponential back-off and do not
    /// surface as errors.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run_with_shutdown<S>(self, shutdown: S) -> Result<ShutdownReport, ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let StreamServer {
            source,
            config,
            coordinator,
            ready_tx,
            state: Bound { listener, queue },
            ..
        } = self;
        let accept_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let context = ConnectionContext {
            source,
            queue: queue.clone(),
            coordinator: coordinator.clone(),
            config,
        };

        tracker.spawn(dispatch(queue, coordinator.draining_token()));
        for _ in 0..config.workers {
            tracker.spawn(accept_loop(
                Arc::clone(&listener),
                AcceptLoopOptions {
                    context: context.clone(),
                    shutdown: accept_token.clone(),
                    tracker: tracker.clone(),
                    backoff: config.accept_backoff,
                },
            ));
        }

        // Signal readiness after all workers have been spawned.
        if let Some(tx) = ready_tx
            && tx.send(()).is_err()
        {
            warn!("Failed to send readiness signal: receiver dropped");
        }
        info!(
            "server listening: addr={:?}, workers={}",
            listener.local_addr().ok(),
            config.workers
        );

        // An external `shutdown()` on the coordinator also stops the server.
        let draining = coordinator.draining_token();
        select! {
            () = shutdown => {},
            () = draining.cancelled() => {},
        }
        accept_token.cancel();

        let report = coordinator.shutdown().await;
        tracker.close();
        tracker.wait().await;
        info!(
            "server stopped: forced={}, remaining_streams={}, elapsed={:?}",
            report.forced, report.remaining_streams, report.elapsed
        );
        Ok(report)
    }
}
