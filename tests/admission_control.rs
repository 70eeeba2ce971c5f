//! Admission control observed from the wire: queueing behind the concurrency
//! bound, queue-full refusals, queued notices and rate-limit headers.

use std::{sync::Arc, time::Duration};

use rstest::rstest;
use streamkeeper::{
    AdmissionConfig,
    AdmissionError,
    Event,
    ReplaySource,
    Session,
    SessionConfig,
    SessionUpdate,
    ShutdownCoordinator,
    StreamServer,
    TcpTransport,
    client::ReconnectConfig,
    server::ServerConfig,
};
use streamkeeper_testing::{TestResult, collect_updates, spawn_server};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

/// Two data events and no terminal, so each stream holds its slot until the
/// client leaves.
fn endless_source() -> ReplaySource {
    ReplaySource::new(vec![Event::data(1u64, "a"), Event::data(2u64, "b")])
}

fn single_attempt() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectConfig {
            max_attempts: 1,
            ..ReconnectConfig::default()
        },
        ..SessionConfig::default()
    }
}

async fn wait_for_connections(coordinator: &ShutdownCoordinator, count: usize) {
    while coordinator.health().connections < count {
        sleep(Duration::from_millis(5)).await;
    }
}

#[rstest]
#[tokio::test]
async fn queued_session_starts_when_the_slot_frees() -> TestResult {
    let coordinator = ShutdownCoordinator::default();
    let server = StreamServer::new(endless_source())
        .admission(AdmissionConfig {
            max_size: 1,
            concurrency: 1,
            ..AdmissionConfig::default()
        })
        .shutdown_coordinator(coordinator.clone());
    let (addr, stop, server_task) = spawn_server(server).await?;
    let transport = Arc::new(TcpTransport::new(addr));

    let mut first = Session::spawn(transport.clone(), single_attempt(), "first");
    let opened = timeout(Duration::from_secs(2), first.next_update()).await?;
    assert!(matches!(opened, Some(SessionUpdate::Items(_))));

    let mut second = Session::spawn(transport.clone(), single_attempt(), "second");
    timeout(Duration::from_secs(2), wait_for_connections(&coordinator, 2)).await?;
    sleep(Duration::from_millis(20)).await;

    let third = Session::spawn(transport.clone(), single_attempt(), "third");
    let refused = timeout(Duration::from_secs(2), collect_updates(third)).await?;
    assert!(matches!(
        refused.last(),
        Some(SessionUpdate::Rejected(AdmissionError::QueueFull { max_size: 1, .. }))
    ));

    first.cancel();
    let started = timeout(Duration::from_secs(2), second.next_update()).await?;
    assert!(matches!(started, Some(SessionUpdate::Items(_))));

    second.cancel();
    let _ = stop.send(());
    server_task.await??;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn long_queue_wait_does_not_time_out_the_session() -> TestResult {
    let coordinator = ShutdownCoordinator::default();
    let server = StreamServer::new(endless_source())
        .config(ServerConfig {
            queued_notice_interval: Duration::from_millis(40),
            ..ServerConfig::default()
        })
        .admission(AdmissionConfig {
            concurrency: 1,
            rate_limit: 2,
            rate_window: Duration::from_secs(60),
            ..AdmissionConfig::default()
        })
        .shutdown_coordinator(coordinator.clone());
    let (addr, stop, server_task) = spawn_server(server).await?;

    let holder = Arc::new(TcpTransport::new(addr));
    let mut first = Session::spawn(holder, single_attempt(), "first");
    let opened = timeout(Duration::from_secs(2), first.next_update()).await?;
    assert!(matches!(opened, Some(SessionUpdate::Items(_))));

    let impatient = Arc::new(TcpTransport::new(addr).connect_timeout(Duration::from_millis(150)));
    let mut second = Session::spawn(impatient, SessionConfig::default(), "second");
    timeout(Duration::from_secs(2), wait_for_connections(&coordinator, 2)).await?;
    sleep(Duration::from_millis(500)).await;

    first.cancel();
    let started = timeout(Duration::from_secs(2), second.next_update()).await?;
    assert!(
        matches!(started, Some(SessionUpdate::Items(_))),
        "expected items, got {started:?}"
    );

    second.cancel();
    let _ = stop.send(());
    server_task.await??;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn rate_limited_refusal_carries_limit_headers() -> TestResult {
    let server = StreamServer::new(endless_source()).admission(AdmissionConfig {
        rate_limit: 1,
        rate_window: Duration::from_secs(60),
        ..AdmissionConfig::default()
    });
    let (addr, stop, server_task) = spawn_server(server).await?;

    let mut admitted = TcpStream::connect(addr).await?;
    admitted.write_all(b"OPEN a\n\n").await?;
    let mut head = [0u8; 8];
    admitted.read_exact(&mut head).await?;
    assert_eq!(&head, b"200 OK\n\n");

    let mut refused = TcpStream::connect(addr).await?;
    refused.write_all(b"OPEN b\n\n").await?;
    let mut reply = String::new();
    timeout(Duration::from_secs(2), refused.read_to_string(&mut reply)).await??;

    assert!(reply.starts_with("429 Too Many Requests\n"), "{reply}");
    assert!(reply.contains("\nX-RateLimit-Limit: 1\n"), "{reply}");
    assert!(reply.contains("\nX-RateLimit-Remaining: 0\n"), "{reply}");
    assert!(reply.contains("\nRetry-After: "), "{reply}");
    assert!(reply.contains(r#""error":"rate_limited""#), "{reply}");

    drop(admitted);
    let _ = stop.send(());
    server_task.await??;
    Ok(())
}
