//! Events carried by a session stream.
//!
//! Every unit delivered on a session has an [`EventId`] assigned by the
//! producer and an [`EventKind`] tag. Identifiers are opaque strings with a
//! total order so that resume and deduplication never depend on numeric
//! arithmetic.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, totally ordered event identifier.
///
/// Shorter identifiers sort before longer ones and identifiers of equal length
/// compare byte-wise. Decimal counters (`"9" < "10"`) and fixed-width ids such
/// as ULIDs or zero-padded sequence numbers therefore order as produced.
///
/// ```
/// use streamkeeper::event::EventId;
///
/// assert!(EventId::from("9") < EventId::from("10"));
/// assert!(EventId::from("01HZX0") < EventId::from("01HZX1"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Create an identifier from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self { Self(value.to_owned()) }
}

impl From<String> for EventId {
    fn from(value: String) -> Self { Self(value) }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self { Self(value.to_string()) }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Kind tag attached to each event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental analysis result.
    Data,
    /// Progress or phase update.
    Status,
    /// Running cost update.
    Cost,
    /// Normal completion of the stream.
    Done,
    /// The producer cancelled the stream.
    Aborted,
    /// The producer failed.
    Error,
}

impl EventKind {
    /// Returns `true` for the kinds that end a stream.
    #[must_use]
    pub fn is_terminal(self) -> bool { matches!(self, Self::Done | Self::Aborted | Self::Error) }

    /// Wire name used by the text codec.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Status => "status",
            Self::Cost => "cost",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Error returned when parsing an unknown [`EventKind`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown event kind `{0}`")]
pub struct UnknownKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Self::Data),
            "status" => Ok(Self::Status),
            "cost" => Ok(Self::Cost),
            "done" => Ok(Self::Done),
            "aborted" => Ok(Self::Aborted),
            "error" => Ok(Self::Error),
            other => Err(UnknownKind(other.to_owned())),
        }
    }
}

/// An ordered unit arriving on a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the session, used for resume and de-duplication.
    pub id: EventId,
    /// How the consumer should treat the event.
    pub kind: EventKind,
    /// Opaque body; may span several lines.
    pub payload: String,
}

impl Event {
    /// Construct an event.
    #[must_use]
    pub fn new(id: impl Into<EventId>, kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: payload.into(),
        }
    }

    /// Shorthand for a [`EventKind::Data`] event.
    #[must_use]
    pub fn data(id: impl Into<EventId>, payload: impl Into<String>) -> Self {
        Self::new(id, EventKind::Data, payload)
    }

    /// Returns `true` if this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool { self.kind.is_terminal() }
}
