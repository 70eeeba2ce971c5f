//! Resume position tracking and duplicate suppression.

use crate::{event::EventId, protocol::OpenRequest};

/// What to do with an incoming event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The id was already delivered; drop the event.
    Duplicate,
    /// A new event. `resumed` is `true` for the first new event after a
    /// reconnect, when the consumer should be told the stream continued.
    Fresh {
        /// Emit a resume notice before this event.
        resumed: bool,
    },
}

/// Per-session resume state.
///
/// Comparison uses the total order of [`EventId`], so opaque string ids work
/// as long as the server issues them in increasing order.
#[derive(Debug, Default)]
pub struct ResumeState {
    last_delivered: Option<EventId>,
    awaiting_resume: bool,
    notice_sent: bool,
}

impl ResumeState {
    /// Highest event id delivered so far.
    #[must_use]
    pub fn last_delivered(&self) -> Option<&EventId> { self.last_delivered.as_ref() }

    /// Build the open request for the next connection attempt.
    #[must_use]
    pub fn request(&self, session_id: &str) -> OpenRequest {
        OpenRequest::new(session_id).resume_after(self.last_delivered.clone())
    }

    /// Note that a reconnect is under way.
    ///
    /// The next fresh event reports `resumed: true`, once per session.
    pub fn on_reconnect(&mut self) {
        if !self.notice_sent {
            self.awaiting_resume = true;
        }
    }

    /// Classify `id` and advance the resume position if it is new.
    pub fn accept(&mut self, id: &EventId) -> Delivery {
        if self.last_delivered.as_ref().is_some_and(|last| id <= last) {
            return Delivery::Duplicate;
        }
        self.last_delivered = Some(id.clone());
        let resumed = std::mem::take(&mut self.awaiting_resume);
        self.notice_sent |= resumed;
        Delivery::Fresh { resumed }
    }

    /// Forget everything for a new session.
    pub fn reset(&mut self) { *self = Self::default(); }
}
