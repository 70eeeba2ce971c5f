//! Session transport: one physical push connection per attempt.
//!
//! The [`SessionTransport`] trait is the seam between the session actor and
//! the network. [`TcpTransport`] is the production implementation; tests
//! substitute scripted or mocked transports.

use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
    time::{error::Elapsed, timeout},
};
use tokio_util::codec::FramedRead;
use tracing::trace;

use crate::{
    admission::AdmissionError,
    codec::{CodecError, DEFAULT_FRAME_LENGTH, EventStreamCodec, Frame},
    protocol::{HeadError, OpenRequest, ResponseHead, read_queued_notice},
};

/// Frames arriving on one connection attempt.
///
/// The stream ends when the peer closes the connection. Errors are yielded
/// once, after which the stream should be dropped.
pub type EventStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Failures of a single connection attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connecting, writing the request, or reading the stream failed.
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
    /// Connecting, or a wait for the response head, took too long.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The response head was malformed.
    #[error("bad response head: {0}")]
    Head(#[from] HeadError),
    /// The event stream could not be decoded.
    #[error("bad event stream: {0}")]
    Codec(#[from] CodecError),
    /// The server refused the session.
    #[error("session rejected: {0}")]
    Rejected(AdmissionError),
}

impl TransportError {
    /// Returns `true` when reconnecting may help.
    ///
    /// Refusals carry their own retry guidance and are surfaced to the
    /// consumer instead of being retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool { !matches!(self, Self::Rejected(_)) }
}

/// Opens push connections for a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Open one connection attempt and return its frames.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Rejected`] when the server refuses the
    /// session and another variant when the attempt fails.
    async fn open(&self, request: &OpenRequest) -> Result<EventStream, TransportError>;
}

/// [`SessionTransport`] over plain TCP.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    addr: SocketAddr,
    connect_timeout: Duration,
    max_frame_length: usize,
}

impl TcpTransport {
    /// Create a transport connecting to `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(5),
            max_frame_length: DEFAULT_FRAME_LENGTH,
        }
    }

    /// Bound connecting, and each silent wait for the response head.
    ///
    /// A server holding the session in its admission queue keeps the wait
    /// alive with queued notices. Defaults to 5 seconds.
    #[must_use]
    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Largest event block accepted from the server.
    #[must_use]
    pub fn max_frame_length(mut self, value: usize) -> Self {
        self.max_frame_length = value;
        self
    }

    /// Server address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr { self.addr }
}

#[async_trait]
impl SessionTransport for TcpTransport {
    async fn open(&self, request: &OpenRequest) -> Result<EventStream, TransportError> {
        let head = request.encode()?;
        let limit = self.connect_timeout;
        let expired = |_: Elapsed| TransportError::Timeout(limit);
        let connect = async {
            let mut stream = TcpStream::connect(self.addr).await?;
            stream.set_nodelay(true)?;
            stream.write_all(head.as_bytes()).await?;
            Ok::<_, io::Error>(stream)
        };
        let mut reader = BufReader::new(timeout(limit, connect).await.map_err(expired)??);

        // Each queued notice restarts the wait for the head.
        while let Some(notice) = timeout(limit, read_queued_notice(&mut reader))
            .await
            .map_err(expired)??
        {
            trace!(session = %request.session_id, %notice, "waiting for admission");
        }
        let response = timeout(limit, ResponseHead::read_from(&mut reader))
            .await
            .map_err(expired)??;

        match response {
            ResponseHead::Accepted => {}
            ResponseHead::Rejected(err) => return Err(TransportError::Rejected(err)),
        }
        let frames = FramedRead::new(reader, EventStreamCodec::new(self.max_frame_length));
        Ok(frames.map(|item| item.map_err(TransportError::from)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        time::Instant,
    };

    use super::*;
    use crate::{admission::Rejection, event::Event};

    async fn serve_once(reply: &'static str) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 256];
            let n = socket.read(&mut buf).await.expect("read");
            socket.write_all(reply.as_bytes()).await.expect("write");
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (addr, task)
    }

    #[tokio::test]
    async fn tcp_transport_streams_frames_after_accept() {
        let (addr, server) = serve_once("200 OK\n\nid: 1\ndata: hi\n\n:\n\n").await;
        let transport = TcpTransport::new(addr);
        let request = OpenRequest::new("s").resume_after(Some("0".into()));
        let mut stream = transport.open(&request).await.expect("open");

        let first = stream.next().await.expect("frame").expect("ok");
        assert_eq!(first, Frame::Event(Event::data("1", "hi")));
        let second = stream.next().await.expect("frame").expect("ok");
        assert_eq!(second, Frame::KeepAlive);
        assert!(stream.next().await.is_none());
        assert_eq!(
            server.await.expect("server"),
            "OPEN s\nLast-Event-ID: 0\n\n"
        );
    }

    #[tokio::test]
    async fn rejection_is_not_retryable() {
        let head = ResponseHead::Rejected(AdmissionError::RateLimited(Rejection::new(
            10,
            0,
            Duration::from_secs(3),
            Instant::now(),
        )))
        .encode()
        .expect("encode");
        let reply: &'static str = Box::leak(head.into_boxed_str());
        let (addr, _server) = serve_once(reply).await;

        let Err(err) = TcpTransport::new(addr).open(&OpenRequest::new("s")).await else {
            panic!("expected rejection");
        };
        assert!(!err.is_retryable());
        let TransportError::Rejected(AdmissionError::RateLimited(rejection)) = err else {
            panic!("expected rate limited, got {err:?}");
        };
        assert_eq!(rejection.retry_after, Duration::from_secs(3));
    }

    /// Accept one connection and write `notices` queued comments, one every
    /// 40 ms, before `head`.
    async fn serve_after_queueing(notices: usize, head: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 256];
            let _ = socket.read(&mut buf).await.expect("read");
            for ahead in (0..notices).rev() {
                tokio::time::sleep(Duration::from_millis(40)).await;
                let notice = crate::protocol::queued_notice(Some(ahead));
                socket.write_all(notice.as_bytes()).await.expect("notice");
            }
            socket.write_all(head.as_bytes()).await.expect("head");
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        addr
    }

    #[tokio::test]
    async fn queued_notices_outlast_the_connect_timeout() {
        let addr = serve_after_queueing(8, "200 OK\n\nid: 1\ndata: late\n\n").await;
        let transport = TcpTransport::new(addr).connect_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let mut stream = transport.open(&OpenRequest::new("s")).await.expect("open");

        assert!(started.elapsed() > Duration::from_millis(100));
        let first = stream.next().await.expect("frame").expect("ok");
        assert_eq!(first, Frame::Event(Event::data("1", "late")));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _held = tokio::spawn(async move {
            let accepted = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(accepted);
        });

        let transport = TcpTransport::new(addr).connect_timeout(Duration::from_millis(50));
        let Err(err) = transport.open(&OpenRequest::new("s")).await else {
            panic!("expected timeout");
        };
        assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let Err(err) = TcpTransport::new(addr).open(&OpenRequest::new("s")).await else {
            panic!("expected connect failure");
        };
        assert!(err.is_retryable());
    }
}
