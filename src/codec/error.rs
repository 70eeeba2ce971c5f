//! Error types for the event stream codec.
//!
//! Framing errors describe problems finding block boundaries; protocol errors
//! describe blocks that were delimited correctly but cannot become an
//! [`Event`](crate::event::Event).

use std::io;

use thiserror::Error;

use crate::event::UnknownKind;

/// Wire-level issues locating a frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// A block grew beyond the configured maximum before its terminator.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Bytes buffered for the block so far.
        size: usize,
        /// Maximum allowed block size.
        max: usize,
    },
    /// The block is not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Semantic violations inside a delimited block.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The block carried fields but no `id`.
    #[error("event without id")]
    MissingId,
    /// The `event` field named an unknown kind.
    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),
    /// An outbound identifier contains a line break and cannot be framed.
    #[error("event id `{0}` contains a line break")]
    UnframeableId(String),
}

/// Top-level codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame boundary problem.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    /// Frame content problem.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Underlying transport failure.
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Returns `true` when the stream cannot continue after this error.
    ///
    /// Protocol errors affect a single block which has already been consumed;
    /// framing and I/O errors leave the byte stream in an unknown state.
    #[must_use]
    pub fn is_fatal(&self) -> bool { !matches!(self, Self::Protocol(_)) }
}
