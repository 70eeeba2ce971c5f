//! Client-side session supervision.
//!
//! A [`Session`] keeps one logical event stream alive across dropped
//! connections. It reconnects with bounded, jittered back-off, resumes from
//! the last delivered event, drops replayed duplicates, detects stalled
//! connections, and paces data items into time-windowed batches before they
//! reach the consumer.

mod batch;
mod error;
mod heartbeat;
mod reconnect;
mod resume;
mod session;

pub use batch::{BatchConfig, MicroBatcher};
pub use error::SessionError;
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use reconnect::{ReconnectConfig, ReconnectManager, RetriesExhausted};
pub use resume::{Delivery, ResumeState};
pub use session::{
    Session,
    SessionConfig,
    SessionHandle,
    SessionStatus,
    SessionUpdate,
    UPDATE_BUFFER,
};
