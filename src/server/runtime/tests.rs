//! Tests for server runtime behaviour.

use std::{
    io,
    sync::{Arc, Mutex},
};

use rstest::rstest;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::yield_now,
    time::{Duration, Instant, advance, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AcceptLoopOptions, BackoffConfig, MockAcceptListener, accept_loop};
use crate::{
    admission::{AdmissionConfig, AdmissionQueue},
    event::{Event, EventKind},
    server::{
        ReplaySource,
        ServerConfig,
        StreamServer,
        connection::ConnectionContext,
        test_util::{bind_server, free_listener, source},
    },
    shutdown::{ShutdownConfig, ShutdownCoordinator},
    transport::{SessionTransport, TcpTransport},
};

fn context(source: ReplaySource) -> ConnectionContext {
    ConnectionContext {
        source: Arc::new(source),
        queue: AdmissionQueue::new(AdmissionConfig::default()).expect("valid admission config"),
        coordinator: ShutdownCoordinator::default(),
        config: ServerConfig::default(),
    }
}

#[rstest]
#[tokio::test]
async fn test_run_with_immediate_shutdown(
    source: ReplaySource,
    free_listener: std::net::TcpListener,
) {
    let server = bind_server(source, free_listener);
    let shutdown_future = async { tokio::time::sleep(Duration::from_millis(10)).await };
    let report = timeout(
        Duration::from_millis(2000),
        server.run_with_shutdown(shutdown_future),
    )
    .await
    .expect("server did not finish in time")
    .expect("server run failed");
    assert!(!report.forced);
}

#[rstest]
#[tokio::test]
async fn ready_signal_fires_and_sessions_stream(
    source: ReplaySource,
    free_listener: std::net::TcpListener,
) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let server = StreamServer::new(source)
        .config(ServerConfig {
            workers: 2,
            ..ServerConfig::default()
        })
        .ready_signal(ready_tx)
        .bind_existing_listener(free_listener)
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));
    ready_rx.await.expect("ready signal");

    let stream = TcpTransport::new(addr)
        .open(&crate::protocol::OpenRequest::new("s"))
        .await
        .expect("open session");
    let frames: Vec<_> = futures::StreamExt::collect(stream).await;
    assert_eq!(frames.len(), 3);

    let _ = stop_tx.send(());
    let report = handle
        .await
        .expect("server join error")
        .expect("server run failed");
    assert!(!report.forced);
}

#[rstest]
#[tokio::test]
async fn live_streams_end_after_the_grace_period(free_listener: std::net::TcpListener) {
    let live = ReplaySource::new(vec![Event::data(1u64, "first")]);
    let coordinator = ShutdownCoordinator::new(ShutdownConfig {
        grace_period: Duration::from_millis(100),
        drain_timeout: Duration::from_millis(500),
        ..ShutdownConfig::default()
    });
    let server = StreamServer::new(live)
        .shutdown_coordinator(coordinator.clone())
        .bind_existing_listener(free_listener)
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));

    let mut stream = TcpTransport::new(addr)
        .open(&crate::protocol::OpenRequest::new("s"))
        .await
        .expect("open session");
    let first = futures::StreamExt::next(&mut stream)
        .await
        .expect("frame")
        .expect("decode");
    assert!(matches!(first, crate::codec::Frame::Event(ref e) if e.kind == EventKind::Data));
    assert_eq!(coordinator.health().streams, 1);

    let _ = stop_tx.send(());
    let report = handle
        .await
        .expect("server join error")
        .expect("server run failed");
    assert!(!report.forced, "the stream honours its cancellation token");
    assert_eq!(report.remaining_streams, 0);
    assert!(report.elapsed >= Duration::from_millis(100));
    assert!(report.elapsed < Duration::from_millis(500));
}

#[tokio::test]
async fn accept_loop_stops_on_shutdown() {
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let listener = Arc::new(
        TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener"),
    );

    tracker.spawn(accept_loop(
        listener,
        AcceptLoopOptions {
            context: context(source()),
            shutdown: token.clone(),
            tracker: tracker.clone(),
            backoff: BackoffConfig::default(),
        },
    ));

    token.cancel();
    tracker.close();

    let result = timeout(Duration::from_millis(100), tracker.wait()).await;
    assert!(result.is_ok());
}

/// A listener whose every `accept` fails, logging when it was called.
fn failing_listener(calls: &Arc<Mutex<Vec<Instant>>>, expected_calls: usize) -> MockAcceptListener {
    let mut listener = MockAcceptListener::new();
    let log = Arc::clone(calls);
    listener
        .expect_accept()
        .times(expected_calls)
        .returning(move || {
            log.lock().expect("lock").push(Instant::now());
            Box::pin(async { Err(io::Error::other("accept failed")) })
        });
    listener
        .expect_local_addr()
        .times(expected_calls)
        .returning(|| Ok("127.0.0.1:0".parse().expect("addr parse")));
    listener
}

#[tokio::test(start_paused = true)]
async fn failing_accepts_back_off_until_shutdown() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(accept_loop(
        Arc::new(failing_listener(&calls, 4)),
        AcceptLoopOptions {
            context: context(source()),
            shutdown: token.clone(),
            tracker: tracker.clone(),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        },
    ));
    yield_now().await;
    for ms in [5, 10, 20] {
        advance(Duration::from_millis(ms)).await;
        yield_now().await;
    }

    // The fourth failure is mid-pause; shutdown must not wait it out.
    token.cancel();
    tracker.close();
    timeout(Duration::from_millis(1), tracker.wait())
        .await
        .expect("accept loop stops during its pause");

    let calls = calls.lock().expect("lock");
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        [5, 10, 20].map(Duration::from_millis),
        "waits double up to the cap"
    );
}
