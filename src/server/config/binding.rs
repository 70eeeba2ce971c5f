//! Listener binding for [`StreamServer`].

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
};

use tokio::net::TcpListener;

use crate::{
    admission::{AdmissionQueue, AdmissionStats},
    server::{Bound, ServerError, StreamServer, Unbound},
};

impl StreamServer<Unbound> {
    /// Bind to `addr`, or to the configured address when `addr` is `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::net::{Ipv4Addr, SocketAddr};
    ///
    /// use streamkeeper::server::{ReplaySource, StreamServer};
    ///
    /// let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    /// # let rt = tokio::runtime::Runtime::new().unwrap();
    /// # let _guard = rt.enter();
    /// let server = StreamServer::new(ReplaySource::default())
    ///     .bind(Some(addr))
    ///     .expect("bind failed");
    /// assert!(server.local_addr().is_some());
    /// ```
    ///
    /// # Errors
    /// Returns a [`ServerError`] if binding or configuring the listener fails
    /// or if the admission limits are invalid.
    pub fn bind(self, addr: Option<SocketAddr>) -> Result<StreamServer<Bound>, ServerError> {
        let addr = addr.unwrap_or(self.config.bind);
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_existing_listener(std_listener)
    }

    /// Bind to an existing `StdTcpListener`.
    ///
    /// # Errors
    /// Returns a [`ServerError`] if configuring the listener fails or if the
    /// admission limits are invalid.
    pub fn bind_existing_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<StreamServer<Bound>, ServerError> {
        let queue = AdmissionQueue::new(self.admission)?;
        std_listener
            .set_nonblocking(true)
            .map_err(ServerError::Bind)?;
        let tokio_listener = TcpListener::from_std(std_listener).map_err(ServerError::Bind)?;

        let StreamServer {
            source,
            config,
            admission,
            coordinator,
            ready_tx,
            ..
        } = self;
        Ok(StreamServer {
            source,
            config,
            admission,
            coordinator,
            ready_tx,
            state: Bound {
                listener: Arc::new(tokio_listener),
                queue,
            },
        })
    }
}

impl StreamServer<Bound> {
    /// Returns the bound address, or `None` if retrieving it fails.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.state.listener.local_addr().ok() }

    /// Snapshot of the admission queue counters.
    #[must_use]
    pub fn admission_stats(&self) -> AdmissionStats { self.state.queue.stats() }
}
