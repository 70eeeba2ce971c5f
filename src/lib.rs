#![doc(html_root_url = "https://docs.rs/streamkeeper/latest")]
//! Public API for the `streamkeeper` library.
//!
//! This crate keeps long-running event streams alive across unreliable
//! connections. The client side reconnects with jittered back-off, resumes
//! from the last delivered event, suppresses replayed duplicates, detects
//! stalled connections, and batches incremental updates. The server side
//! applies admission control with a sliding rate window and drains
//! gracefully on shutdown.

pub mod admission;
pub mod client;
pub mod codec;
pub mod config;
pub mod event;
pub mod metrics;
pub mod panic;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use admission::{AdmissionConfig, AdmissionError, AdmissionQueue, Rejection};
pub use client::{Session, SessionConfig, SessionHandle, SessionStatus, SessionUpdate};
pub use config::{ConfigError, StreamConfig};
pub use event::{Event, EventId, EventKind};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, STREAMS_ACTIVE};
pub use server::{ReplaySource, ScenarioSource, StreamServer};
pub use shutdown::{HealthSnapshot, LifecycleState, ShutdownCoordinator, ShutdownReport};
pub use transport::{SessionTransport, TcpTransport, TransportError};
