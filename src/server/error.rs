//! Errors raised by [`StreamServer`](super::StreamServer) operations.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{admission::AdmissionConfigError, codec::CodecError, protocol::HeadError};

/// Errors that may occur while binding or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or configuring the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),
    /// Accepting a connection failed.
    #[error("accept error: {0}")]
    Accept(#[from] io::Error),
    /// The admission limits are unusable.
    #[error(transparent)]
    Admission(#[from] AdmissionConfigError),
}

/// Reasons a single connection ended early.
#[derive(Debug, Error)]
pub(crate) enum ConnectionError {
    #[error("connection i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("open request rejected: {0}")]
    Head(#[from] HeadError),
    #[error("open request not received within {0:?}")]
    ReadTimeout(Duration),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
