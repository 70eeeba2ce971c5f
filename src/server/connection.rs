//! Connection handling for [`StreamServer`](super::StreamServer).

use std::{net::SocketAddr, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{FutureExt, SinkExt, StreamExt};
use leaky_bucket::RateLimiter;
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::{Instant, interval_at, sleep, timeout},
};
use tokio_util::{codec::FramedWrite, sync::CancellationToken, task::TaskTracker};

use super::{ScenarioSource, ServerConfig, dispatch::StartSignal, error::ConnectionError};
use crate::{
    admission::{AdmissionError, AdmissionQueue},
    codec::{CodecError, EventStreamCodec, Frame, FramingError},
    event::{Event, EventKind},
    metrics::{self, Direction},
    protocol::{OpenRequest, ResponseHead, bad_request, queued_notice},
    shutdown::ShutdownCoordinator,
};

/// Everything a connection task needs, shared by all connections.
#[derive(Clone)]
pub(super) struct ConnectionContext {
    pub source: Arc<dyn ScenarioSource>,
    pub queue: AdmissionQueue<StartSignal>,
    pub coordinator: ShutdownCoordinator,
    pub config: ServerConfig,
}

/// How an accepted stream finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Terminal,
    Cancelled,
    ClientGone,
}

/// Spawn a task to process a single TCP connection, logging and discarding any panics.
pub(super) fn spawn_connection_task(
    stream: TcpStream,
    ctx: ConnectionContext,
    tracker: &TaskTracker,
) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("Failed to retrieve peer address: error={e}");
            None
        }
    };
    tracker.spawn(async move {
        let fut = AssertUnwindSafe(process_stream(stream, peer_addr, ctx)).catch_unwind();

        match fut.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("connection ended early: error={e}, peer_addr={peer_addr:?}"),
            Err(panic) => {
                let panic_msg = crate::panic::format_panic(&*panic);
                // Emit via both `log` and `tracing` for tests that capture either.
                error!("connection task panicked: panic={panic_msg}, peer_addr={peer_addr:?}");
                tracing::error!(panic = %panic_msg, ?peer_addr, "connection task panicked");
            }
        }
    });
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn process_stream(
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    ctx: ConnectionContext,
) -> Result<(), ConnectionError> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let cancel = ctx.coordinator.cancel_token();
    let read_timeout = ctx.config.read_timeout;

    let request = select! {
        biased;

        () = cancel.cancelled() => return Ok(()),
        res = timeout(read_timeout, OpenRequest::read_from(&mut reader)) => match res {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => return reject_request(&mut writer, e.into()).await,
            Err(_) => {
                return reject_request(&mut writer, ConnectionError::ReadTimeout(read_timeout)).await;
            }
        },
    };

    let _connection = match ctx.coordinator.track_connection(peer_addr) {
        Ok(guard) => guard,
        Err(refused) => return refuse(&mut writer, refused.into()).await,
    };

    let (signal, mut start) = StartSignal::channel();
    let entry = match ctx.queue.enqueue(0, signal) {
        Ok(entry) => entry,
        Err(err) => return refuse(&mut writer, err).await,
    };
    debug!(
        "session queued: session={}, entry={entry}, position={:?}, peer_addr={peer_addr:?}",
        request.session_id,
        ctx.queue.position(entry)
    );

    let draining = ctx.coordinator.draining_token();
    let every = ctx.config.queued_notice_interval;
    let mut notices = interval_at(Instant::now() + every, every);
    let lease = loop {
        select! {
            biased;

            () = draining.cancelled() => {
                ctx.queue.cancel(entry);
                return refuse(&mut writer, ctx.coordinator.refusal().into()).await;
            }
            () = closed(&mut reader) => {
                ctx.queue.cancel(entry);
                debug!("client left the queue: session={}, peer_addr={peer_addr:?}", request.session_id);
                return Ok(());
            }
            granted = &mut start => match granted {
                Ok(lease) => break lease,
                Err(_) => return refuse(&mut writer, ctx.coordinator.refusal().into()).await,
            },
            _ = notices.tick() => {
                let notice = queued_notice(ctx.queue.position(entry));
                if let Err(e) = writer.write_all(notice.as_bytes()).await {
                    ctx.queue.cancel(entry);
                    return Err(e.into());
                }
            }
        }
    };

    let stream_guard = match ctx.coordinator.track_stream() {
        Ok(guard) => guard,
        Err(refused) => {
            lease.fail();
            return refuse(&mut writer, refused.into()).await;
        }
    };
    writer
        .write_all(ResponseHead::Accepted.encode()?.as_bytes())
        .await?;
    info!(
        "stream started: session={}, resume_after={:?}, waited={:?}, peer_addr={peer_addr:?}",
        request.session_id,
        request.last_event_id,
        lease.waited()
    );

    match write_events(&mut reader, writer, &request, &ctx, stream_guard.token()).await {
        Ok(end) => {
            lease.complete();
            info!(
                "stream finished: session={}, end={end:?}, peer_addr={peer_addr:?}",
                request.session_id
            );
            Ok(())
        }
        Err(e) => {
            lease.fail();
            Err(e)
        }
    }
}

/// Answer an unusable open request and report why.
async fn reject_request(
    writer: &mut OwnedWriteHalf,
    err: ConnectionError,
) -> Result<(), ConnectionError> {
    let _ = writer.write_all(bad_request().as_bytes()).await;
    Err(err)
}

/// Write the refusal head for `err` and close the write side.
async fn refuse(writer: &mut OwnedWriteHalf, err: AdmissionError) -> Result<(), ConnectionError> {
    debug!("session refused: reason={}", err.reason());
    let head = ResponseHead::Rejected(err).encode()?;
    writer.write_all(head.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Resolves once the client closes its side or the read fails.
async fn closed(reader: &mut BufReader<OwnedReadHalf>) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn limiter(rate: usize) -> RateLimiter {
    RateLimiter::builder()
        .initial(rate)
        .refill(rate)
        .interval(Duration::from_secs(1))
        .max(rate)
        .build()
}

/// Stream events after the requested position until a terminal event, the
/// stream's cancellation, or the client leaving.
///
/// Once the source runs dry without a terminal event the connection stays
/// open on keep-alives, as a live producer with nothing new to say would.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn write_events(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    request: &OpenRequest,
    ctx: &ConnectionContext,
    token: &CancellationToken,
) -> Result<StreamEnd, ConnectionError> {
    let mut sink = FramedWrite::new(writer, EventStreamCodec::new(ctx.config.max_frame_length));
    let mut events = ctx
        .source
        .events(&request.session_id, request.last_event_id.as_ref());
    let limiter = ctx.config.events_per_second.map(limiter);
    let idle = ctx.config.keep_alive_interval;
    let keep_alive = sleep(idle);
    tokio::pin!(keep_alive);
    let mut exhausted = false;

    loop {
        let frame = select! {
            biased;

            () = token.cancelled() => return Ok(StreamEnd::Cancelled),
            () = closed(reader) => return Ok(StreamEnd::ClientGone),
            next = events.next(), if !exhausted => match next {
                Some(event) => Frame::Event(event),
                None => {
                    exhausted = true;
                    continue;
                }
            },
            () = &mut keep_alive => Frame::KeepAlive,
        };

        let event_id = match &frame {
            Frame::Event(event) => Some(event.id.clone()),
            Frame::KeepAlive => None,
        };
        let terminal = matches!(&frame, Frame::Event(event) if event.is_terminal());
        if event_id.is_some() && let Some(limiter) = limiter.as_ref() {
            select! {
                biased;

                () = token.cancelled() => return Ok(StreamEnd::Cancelled),
                () = limiter.acquire_one() => {}
            }
        }
        let sent = select! {
            biased;

            () = token.cancelled() => return Ok(StreamEnd::Cancelled),
            res = sink.send(frame) => res,
        };
        let terminal = match (sent, event_id) {
            (Ok(()), None) => terminal,
            (Ok(()), Some(_)) => {
                metrics::add_events(Direction::Outbound, 1);
                terminal
            }
            (Err(CodecError::Framing(FramingError::OversizedFrame { size, max })), Some(id)) => {
                warn!("event exceeds frame limit: id={id}, size={size}, max={max}");
                let notice = Event::new(
                    id,
                    EventKind::Error,
                    format!("event of {size} bytes exceeds the {max}-byte frame limit"),
                );
                select! {
                    biased;

                    () = token.cancelled() => return Ok(StreamEnd::Cancelled),
                    res = sink.send(Frame::Event(notice)) => res?,
                }
                metrics::add_events(Direction::Outbound, 1);
                true
            }
            (Err(e), _) => return Err(e.into()),
        };
        keep_alive.as_mut().reset(Instant::now() + idle);
        if terminal {
            sink.get_mut().shutdown().await?;
            return Ok(StreamEnd::Terminal);
        }
    }
}
