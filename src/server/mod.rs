//! Tokio-based server for resumable event streams.
//!
//! `StreamServer` accepts TCP connections, reads an open request, registers
//! the connection with the [`ShutdownCoordinator`], admits it through an
//! [`AdmissionQueue`], and once the dispatcher grants a processing slot
//! writes the events produced by a [`ScenarioSource`] from the requested
//! resume position onward.

use std::sync::Arc;

use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    admission::{AdmissionConfig, AdmissionQueue},
    shutdown::ShutdownCoordinator,
};

mod config;
pub use config::{MAX_EVENT_RATE, ServerConfig, binding};
mod connection;
mod dispatch;
pub mod error;
mod runtime;
pub mod source;

pub use error::ServerError;
/// Re-exported configuration types for server backoff behavior.
pub use runtime::BackoffConfig;
pub use source::{ReplaySource, ScenarioSource};

#[cfg(test)]
pub(crate) mod test_util;

/// Server streaming events to resuming clients.
///
/// The server carries a typestate `S` indicating whether it is [`Unbound`]
/// or [`Bound`]. New servers start `Unbound` and must call
/// [`StreamServer::bind`] or [`StreamServer::bind_existing_listener`] before
/// running.
pub struct StreamServer<S = Unbound>
where
    S: ServerState,
{
    pub(crate) source: Arc<dyn ScenarioSource>,
    pub(crate) config: ServerConfig,
    pub(crate) admission: AdmissionConfig,
    pub(crate) coordinator: ShutdownCoordinator,
    /// Channel used to notify when the server is ready.
    ///
    /// A `oneshot::Sender` transmits only one readiness notification, so a
    /// new sender must be provided each time the server is started.
    pub(crate) ready_tx: Option<oneshot::Sender<()>>,
    pub(crate) state: S,
}

/// Marker indicating the server has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the server is bound to a TCP listener.
#[derive(Debug, Clone)]
pub struct Bound {
    pub(crate) listener: Arc<TcpListener>,
    pub(crate) queue: AdmissionQueue<dispatch::StartSignal>,
}

/// Trait implemented by [`Unbound`] and [`Bound`] to model binding typestate.
pub trait ServerState: sealed::Sealed {}

mod sealed {
    //! Prevent external implementations of [`ServerState`].

    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

impl<S: ServerState> StreamServer<S> {
    /// Coordinator tracking this server's connections and streams.
    ///
    /// Clones share state, so a clone taken before running can report
    /// [`health`](ShutdownCoordinator::health) while the server drains.
    #[must_use]
    pub fn coordinator(&self) -> &ShutdownCoordinator { &self.coordinator }

    /// Effective server settings.
    #[must_use]
    pub fn server_config(&self) -> &ServerConfig { &self.config }
}
