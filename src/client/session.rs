//! Session actor.
//!
//! One task per session owns the reconnect, heartbeat, resume and batch
//! state and drives all of it from a single `select!` per phase, so no state
//! is shared and every timer dies with the task.

use std::{pin::Pin, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    sync::{
        mpsc::{self, error::SendError},
        watch,
    },
    task::JoinHandle,
    time::{Sleep, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{
    BatchConfig,
    HeartbeatConfig,
    ReconnectConfig,
    SessionError,
    batch::MicroBatcher,
    heartbeat::HeartbeatMonitor,
    reconnect::ReconnectManager,
    resume::{Delivery, ResumeState},
};
use crate::{
    admission::AdmissionError,
    codec::Frame,
    event::{Event, EventKind},
    metrics::{self, Direction},
    transport::{EventStream, SessionTransport, TransportError},
};

/// Client-side settings for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SessionConfig {
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Stall detection.
    pub heartbeat: HeartbeatConfig,
    /// Consumer pacing.
    pub batch: BatchConfig,
}

/// Lifecycle of a session as seen by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// First connection attempt in progress.
    Connecting,
    /// Stream open and delivering.
    Open,
    /// Waiting out a back-off delay or re-opening.
    Reconnecting,
    /// The producer completed the stream.
    Done,
    /// The consumer cancelled the session.
    Cancelled,
    /// The producer cancelled the stream.
    Aborted,
    /// Retries were exhausted, the server refused the session, or the
    /// producer reported an error.
    Failed,
}

impl SessionStatus {
    /// Returns `true` once the session has ended.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

/// Notification delivered to the consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A batch of data items, oldest first.
    Items(Vec<Event>),
    /// A status event, delivered without batching.
    Status(Event),
    /// A cost event, delivered without batching.
    Cost(Event),
    /// New data arrived after a reconnect.
    Resumed,
    /// A reconnect attempt is scheduled after `delay`.
    Reconnecting {
        /// One-based attempt number since the last successful open.
        attempt: u32,
        /// Back-off delay before the attempt.
        delay: Duration,
    },
    /// The producer completed the stream.
    Done,
    /// The producer cancelled the stream.
    Aborted,
    /// The producer failed; carries the error payload.
    Error(String),
    /// Reconnect attempts were exhausted.
    Failed {
        /// Attempts made since the last successful open.
        attempts: u32,
        /// The failure that ended the session.
        last_error: String,
    },
    /// The server refused the session.
    Rejected(AdmissionError),
    /// The consumer cancelled the session.
    Cancelled,
}

impl SessionUpdate {
    /// Returns `true` for the notification that ends a session.
    #[must_use]
    pub fn is_terminal(&self) -> bool { self.terminal_status().is_some() }

    fn terminal_status(&self) -> Option<SessionStatus> {
        match self {
            Self::Done => Some(SessionStatus::Done),
            Self::Aborted => Some(SessionStatus::Aborted),
            Self::Cancelled => Some(SessionStatus::Cancelled),
            Self::Error(_) | Self::Failed { .. } | Self::Rejected(_) => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

/// Updates that may wait unread before the session holds items back.
///
/// While the consumer lags, data items stay in the micro-batch buffer, which
/// keeps only the newest [`BatchConfig::max_size`] of them.
pub const UPDATE_BUFFER: usize = 16;

/// Consumer side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: String,
    updates: mpsc::Receiver<SessionUpdate>,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str { &self.session_id }

    /// Receive the next notification. Returns `None` after the terminal
    /// notification has been received and the session task has exited.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> { self.updates.recv().await }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus { *self.status.borrow() }

    /// Watch status transitions.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> { self.status.clone() }

    /// Cancel the session: stop reconnecting, close the connection, flush
    /// buffered items, and stop the heartbeat.
    pub fn cancel(&self) { self.cancel.cancel(); }

    /// Wait for the session task to exit.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the task panicked or was aborted.
    pub async fn join(self) -> Result<(), SessionError> { Ok(self.task.await?) }
}

/// Entry point for client sessions.
pub struct Session;

impl Session {
    /// Spawn the actor for `session_id` and return its handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(
        transport: Arc<dyn SessionTransport>,
        config: SessionConfig,
        session_id: impl Into<String>,
    ) -> SessionHandle {
        let session_id = session_id.into();
        let (updates_tx, updates) = mpsc::channel(UPDATE_BUFFER);
        let (status_tx, status) = watch::channel(SessionStatus::Connecting);
        let cancel = CancellationToken::new();
        let actor = SessionActor {
            session_id: session_id.clone(),
            transport,
            updates: updates_tx,
            status: status_tx,
            cancel: cancel.clone(),
            reconnect: ReconnectManager::new(config.reconnect),
            heartbeat: HeartbeatMonitor::new(config.heartbeat),
            resume: ResumeState::default(),
            batch: MicroBatcher::new(config.batch),
        };
        let span = info_span!("session", session_id = %session_id);
        let task = tokio::spawn(actor.run().instrument(span));
        SessionHandle {
            session_id,
            updates,
            status,
            cancel,
            task,
        }
    }
}

enum Phase {
    Connect,
    Streaming(EventStream),
    Backoff(Pin<Box<Sleep>>),
}

enum Exit {
    Update(SessionUpdate),
    ConsumerGone,
}

const CANCELLED: Exit = Exit::Update(SessionUpdate::Cancelled);

struct SessionActor {
    session_id: String,
    transport: Arc<dyn SessionTransport>,
    updates: mpsc::Sender<SessionUpdate>,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
    reconnect: ReconnectManager,
    heartbeat: HeartbeatMonitor,
    resume: ResumeState,
    batch: MicroBatcher<Event>,
}

impl SessionActor {
    async fn run(mut self) {
        debug!("session starting");
        let mut phase = Phase::Connect;
        let exit = loop {
            let next = match phase {
                Phase::Connect => self.connect().await,
                Phase::Streaming(events) => self.stream(events).await,
                Phase::Backoff(delay) => self.backoff(delay).await,
            };
            match next {
                Ok(next) => phase = next,
                Err(exit) => break exit,
            }
        };
        self.finish(exit).await;
    }

    async fn connect(&mut self) -> Result<Phase, Exit> {
        let request = self.resume.request(&self.session_id);
        let transport = Arc::clone(&self.transport);
        let mut open = transport.open(&request);
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(CANCELLED),
                () = self.updates.closed() => return Err(Exit::ConsumerGone),
                batch = due_batch(&mut self.batch, self.updates.clone()) => release(batch)?,
                opened = &mut open => return self.opened(opened).await,
            }
        }
    }

    async fn opened(&mut self, result: Result<EventStream, TransportError>) -> Result<Phase, Exit> {
        match result {
            Ok(events) => {
                self.reconnect.reset();
                self.heartbeat.beat();
                self.status.send_replace(SessionStatus::Open);
                info!(last_event_id = ?self.resume.last_delivered(), "session open");
                Ok(Phase::Streaming(events))
            }
            Err(TransportError::Rejected(err)) => {
                warn!(reason = err.reason(), "session rejected");
                Err(Exit::Update(SessionUpdate::Rejected(err)))
            }
            Err(e) => self.retry(&e.to_string()).await,
        }
    }

    async fn stream(&mut self, mut events: EventStream) -> Result<Phase, Exit> {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(CANCELLED),
                () = self.updates.closed() => return Err(Exit::ConsumerGone),
                batch = due_batch(&mut self.batch, self.updates.clone()) => release(batch)?,
                // Buffered frames are read before the stall check.
                frame = events.next() => match frame {
                    Some(Ok(Frame::KeepAlive)) => self.heartbeat.beat(),
                    Some(Ok(Frame::Event(event))) => {
                        self.heartbeat.beat();
                        self.on_event(event).await?;
                    }
                    Some(Err(TransportError::Rejected(err))) => {
                        return Err(Exit::Update(SessionUpdate::Rejected(err)));
                    }
                    Some(Err(e)) => return self.retry(&e.to_string()).await,
                    None => return self.retry("stream closed before a terminal event").await,
                },
                () = self.heartbeat.expired() => {
                    warn!("session stalled");
                    return self.retry("no activity within heartbeat timeout").await;
                }
            }
        }
    }

    async fn backoff(&mut self, mut delay: Pin<Box<Sleep>>) -> Result<Phase, Exit> {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(CANCELLED),
                () = self.updates.closed() => return Err(Exit::ConsumerGone),
                batch = due_batch(&mut self.batch, self.updates.clone()) => release(batch)?,
                () = &mut delay => {
                    self.reconnect.record_attempt();
                    return Ok(Phase::Connect);
                }
            }
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<(), Exit> {
        match self.resume.accept(&event.id) {
            Delivery::Duplicate => {
                metrics::inc_duplicates();
                debug!(id = %event.id, "duplicate dropped");
                return Ok(());
            }
            Delivery::Fresh { resumed: true } => {
                self.flush_items().await?;
                info!(id = %event.id, "session resumed");
                self.emit(SessionUpdate::Resumed).await?;
            }
            Delivery::Fresh { resumed: false } => {}
        }
        match event.kind {
            EventKind::Data => {
                self.batch.push(event);
                Ok(())
            }
            EventKind::Status => {
                self.flush_items().await?;
                metrics::add_events(Direction::Inbound, 1);
                self.emit(SessionUpdate::Status(event)).await
            }
            EventKind::Cost => {
                self.flush_items().await?;
                metrics::add_events(Direction::Inbound, 1);
                self.emit(SessionUpdate::Cost(event)).await
            }
            EventKind::Done => Err(Exit::Update(SessionUpdate::Done)),
            EventKind::Aborted => Err(Exit::Update(SessionUpdate::Aborted)),
            EventKind::Error => Err(Exit::Update(SessionUpdate::Error(event.payload))),
        }
    }

    async fn retry(&mut self, error: &str) -> Result<Phase, Exit> {
        self.heartbeat.stop();
        self.reconnect.record_error(error);
        let delay = match self.reconnect.next_delay() {
            Ok(delay) => delay,
            Err(exhausted) => {
                warn!(attempts = exhausted.attempts, error, "reconnect attempts exhausted");
                return Err(Exit::Update(SessionUpdate::Failed {
                    attempts: exhausted.attempts,
                    last_error: error.to_owned(),
                }));
            }
        };
        let attempt = self.reconnect.attempts() + 1;
        self.resume.on_reconnect();
        self.status.send_replace(SessionStatus::Reconnecting);
        info!(attempt, ?delay, error, "reconnecting");
        self.emit(SessionUpdate::Reconnecting { attempt, delay }).await?;
        Ok(Phase::Backoff(Box::pin(sleep(delay))))
    }

    /// Wait for room and send `update`, giving up if the session is cancelled.
    async fn emit(&self, update: SessionUpdate) -> Result<(), Exit> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CANCELLED),
            sent = self.updates.send(update) => sent.map_err(|_| Exit::ConsumerGone),
        }
    }

    async fn flush_items(&mut self) -> Result<(), Exit> {
        let items = self.batch.flush();
        if items.is_empty() {
            return Ok(());
        }
        metrics::add_events(Direction::Inbound, items.len() as u64);
        self.emit(SessionUpdate::Items(items)).await
    }

    /// Tear down every timer and emit the single terminal notification,
    /// preceded by whatever items were still buffered.
    async fn finish(&mut self, exit: Exit) {
        self.heartbeat.stop();
        let pending = self.batch.flush();
        self.batch.clear();
        if !self.reconnect.mark_completed() {
            return;
        }
        let Exit::Update(update) = exit else {
            debug!("consumer dropped; session ending quietly");
            self.status.send_replace(SessionStatus::Cancelled);
            return;
        };
        let status = update
            .terminal_status()
            .unwrap_or(SessionStatus::Failed);
        self.status.send_replace(status);
        info!(?status, "session ended");
        if !pending.is_empty() {
            metrics::add_events(Direction::Inbound, pending.len() as u64);
            if self.updates.send(SessionUpdate::Items(pending)).await.is_err() {
                return;
            }
        }
        // The consumer may already be gone; nothing is left to notify.
        let _ = self.updates.send(update).await;
    }
}

type DueBatch = Result<(mpsc::OwnedPermit<SessionUpdate>, Vec<Event>), SendError<()>>;

/// Wait until the batch window has elapsed and the consumer has room, then
/// take the batch. Cancel safe; items keep arriving in `batch` meanwhile.
async fn due_batch(
    batch: &mut MicroBatcher<Event>,
    updates: mpsc::Sender<SessionUpdate>,
) -> DueBatch {
    batch.due().await;
    let permit = updates.reserve_owned().await?;
    Ok((permit, batch.flush()))
}

fn release(batch: DueBatch) -> Result<(), Exit> {
    let (permit, items) = batch.map_err(|_| Exit::ConsumerGone)?;
    if !items.is_empty() {
        metrics::add_events(Direction::Inbound, items.len() as u64);
        permit.send(SessionUpdate::Items(items));
    }
    Ok(())
}
