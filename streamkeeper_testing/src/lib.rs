//! Utilities for exercising `streamkeeper` sessions and servers in tests.
//!
//! [`ScriptedTransport`] replays a fixed sequence of connection outcomes so
//! reconnect, resume and heartbeat behaviour can be driven without sockets.
//! The remaining helpers bind throwaway listeners, serialise log capture and
//! collect session updates.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use streamkeeper::{Event, Session, SessionConfig, SessionUpdate};
//! use streamkeeper_testing::{Step, ScriptedTransport, collect_updates};
//!
//! # async fn example() {
//! let transport = Arc::new(ScriptedTransport::new([Step::frames([
//!     Event::data(1u64, "a"),
//!     Event::new(2u64, streamkeeper::EventKind::Done, ""),
//! ])]));
//! let handle = Session::spawn(transport, SessionConfig::default(), "s");
//! let updates = collect_updates(handle).await;
//! assert_eq!(updates.last(), Some(&SessionUpdate::Done));
//! # }
//! ```

mod integration_helpers;
mod logging;
mod scripted;

pub use integration_helpers::{
    TestResult,
    collect_updates,
    delivered_ids,
    spawn_server,
    unused_listener,
};
pub use logging::{LoggerHandle, logger};
pub use scripted::{ScriptedTransport, Step};
