//! Producers of the events written to each session.

use std::{collections::HashMap, fmt, io, path::Path, time::Duration};

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};

use crate::event::{Event, EventId};

/// Supplies the ordered events of a session.
///
/// Implementations must return events in increasing [`EventId`] order and
/// skip every event at or before `after`, so a resuming client continues
/// exactly where it left off.
pub trait ScenarioSource: Send + Sync + 'static {
    /// Events of `session_id` strictly after `after`.
    fn events(&self, session_id: &str, after: Option<&EventId>) -> BoxStream<'static, Event>;
}

/// In-memory source replaying a fixed script.
///
/// Sessions without their own script share the default one. An optional
/// interval spaces events out to imitate a live producer.
///
/// ```
/// use futures::StreamExt;
/// use streamkeeper::{
///     event::{Event, EventId, EventKind},
///     server::{ReplaySource, ScenarioSource},
/// };
///
/// # futures::executor::block_on(async {
/// let source = ReplaySource::new(vec![
///     Event::data(1u64, "a"),
///     Event::data(2u64, "b"),
///     Event::new(3u64, EventKind::Done, ""),
/// ]);
/// let after = EventId::from(1u64);
/// let ids: Vec<_> = source
///     .events("any", Some(&after))
///     .map(|e| e.id.to_string())
///     .collect()
///     .await;
/// assert_eq!(ids, ["2", "3"]);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct ReplaySource {
    script: Vec<Event>,
    sessions: HashMap<String, Vec<Event>>,
    interval: Duration,
}

impl fmt::Debug for ReplaySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplaySource")
            .field("script_len", &self.script.len())
            .field("sessions", &self.sessions.len())
            .field("interval", &self.interval)
            .finish()
    }
}

impl ReplaySource {
    /// Replay `script` to every session.
    #[must_use]
    pub fn new(script: Vec<Event>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Load the default script from a JSON array of events.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let script = serde_json::from_str(&raw).map_err(io::Error::other)?;
        Ok(Self::new(script))
    }

    /// Replay `script` to `session_id` instead of the default script.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>, script: Vec<Event>) -> Self {
        self.sessions.insert(session_id.into(), script);
        self
    }

    /// Wait `interval` before each event.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl ScenarioSource for ReplaySource {
    fn events(&self, session_id: &str, after: Option<&EventId>) -> BoxStream<'static, Event> {
        let script = self.sessions.get(session_id).unwrap_or(&self.script);
        let remaining: Vec<Event> = script
            .iter()
            .filter(|event| after.is_none_or(|after| event.id > *after))
            .cloned()
            .collect();
        let interval = self.interval;
        if interval.is_zero() {
            return stream::iter(remaining).boxed();
        }
        stream::iter(remaining)
            .then(move |event| async move {
                tokio::time::sleep(interval).await;
                event
            })
            .boxed()
    }
}
