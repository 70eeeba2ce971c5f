//! Test helpers shared across server modules.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use rstest::fixture;

use super::{Bound, ReplaySource, StreamServer};
use crate::event::{Event, EventKind};

#[fixture]
pub fn source() -> ReplaySource {
    ReplaySource::new(vec![
        Event::data(1u64, "a"),
        Event::data(2u64, "b"),
        Event::new(3u64, EventKind::Done, ""),
    ])
}

#[fixture]
/// Returns a bound [`StdTcpListener`] on a free port for use in tests.
///
/// Keeping the listener bound prevents race conditions where another
/// process could claim the port between discovery and use.
pub fn free_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("Failed to bind free port listener")
}

pub fn bind_server(source: ReplaySource, listener: StdTcpListener) -> StreamServer<Bound> {
    StreamServer::new(source)
        .bind_existing_listener(listener)
        .expect("Failed to bind")
}
