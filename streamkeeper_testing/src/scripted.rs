//! A [`SessionTransport`] that replays scripted connection outcomes.

use std::{
    collections::VecDeque,
    io,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::StreamExt;
use streamkeeper::{
    AdmissionError,
    Event,
    codec::Frame,
    protocol::OpenRequest,
    transport::{EventStream, SessionTransport, TransportError},
};

/// Outcome of one `open` call.
#[derive(Clone, Debug)]
pub enum Step {
    /// The connection is refused with an I/O error.
    Refuse,
    /// The server answers with an admission refusal.
    Reject(AdmissionError),
    /// The stream yields these frames and then ends.
    Frames(Vec<Frame>),
    /// The stream yields these frames and then goes silent without closing.
    FramesThenHang(Vec<Frame>),
    /// The stream yields these frames and then fails mid-stream.
    FramesThenError(Vec<Frame>),
}

impl Step {
    /// Events delivered before the stream ends.
    pub fn frames(events: impl IntoIterator<Item = Event>) -> Self {
        Self::Frames(events.into_iter().map(Frame::Event).collect())
    }

    /// Events delivered before the stream goes silent.
    pub fn hang_after(events: impl IntoIterator<Item = Event>) -> Self {
        Self::FramesThenHang(events.into_iter().map(Frame::Event).collect())
    }
}

/// Transport replaying [`Step`]s in order.
///
/// Once the script is exhausted every further `open` is refused. Each
/// request is recorded so tests can assert on `Last-Event-ID`.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<OpenRequest>>,
}

impl ScriptedTransport {
    /// Create a transport replaying `steps`.
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::default(),
        }
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<OpenRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `open` calls so far.
    pub fn opens(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn refused() -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "scripted refusal",
    ))
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    async fn open(&self, request: &OpenRequest) -> Result<EventStream, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match step {
            None | Some(Step::Refuse) => Err(refused()),
            Some(Step::Reject(err)) => Err(TransportError::Rejected(err)),
            Some(Step::Frames(frames)) => Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed()),
            Some(Step::FramesThenHang(frames)) => Ok(async_stream::stream! {
                for frame in frames {
                    yield Ok(frame);
                }
                futures::future::pending::<()>().await;
            }
            .boxed()),
            Some(Step::FramesThenError(frames)) => Ok(async_stream::stream! {
                for frame in frames {
                    yield Ok(frame);
                }
                yield Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "scripted reset",
                )));
            }
            .boxed()),
        }
    }
}
