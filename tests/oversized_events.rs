//! An event larger than the frame limit ends the session instead of looping
//! through reconnects.

use std::{sync::Arc, time::Duration};

use rstest::rstest;
use streamkeeper::{
    AdmissionConfig,
    Event,
    ReplaySource,
    Session,
    SessionConfig,
    SessionStatus,
    SessionUpdate,
    StreamServer,
    TcpTransport,
    codec::DEFAULT_FRAME_LENGTH,
};
use streamkeeper_testing::{TestResult, collect_updates, delivered_ids, spawn_server};
use tokio::time::timeout;

#[rstest]
#[tokio::test]
async fn oversized_event_fails_the_session_once() -> TestResult {
    let source = ReplaySource::new(vec![
        Event::data(1u64, "small"),
        Event::data(2u64, "x".repeat(DEFAULT_FRAME_LENGTH + 1)),
        Event::data(3u64, "never sent"),
    ]);
    let server = StreamServer::new(source).admission(AdmissionConfig {
        rate_limit: 2,
        rate_window: Duration::from_secs(60),
        ..AdmissionConfig::default()
    });
    let (addr, stop, server_task) = spawn_server(server).await?;

    let transport = Arc::new(TcpTransport::new(addr));
    let handle = Session::spawn(transport, SessionConfig::default(), "too-big");
    let status = handle.watch_status();
    let updates = timeout(Duration::from_secs(5), collect_updates(handle)).await?;

    assert!(
        !updates
            .iter()
            .any(|u| matches!(u, SessionUpdate::Reconnecting { .. })),
        "{updates:?}"
    );
    assert_eq!(delivered_ids(&updates), ["1"]);
    let Some(SessionUpdate::Error(message)) = updates.last() else {
        panic!("expected an error, got {updates:?}");
    };
    assert!(message.contains("frame limit"), "{message}");
    assert_eq!(*status.borrow(), SessionStatus::Failed);

    let _ = stop.send(());
    server_task.await??;
    Ok(())
}
