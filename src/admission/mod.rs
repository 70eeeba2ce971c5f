//! Producer-side admission control.
//!
//! [`AdmissionQueue`] gates new session requests with three checks made under
//! a single lock: a bounded pending list, a sliding-window request cap, and a
//! concurrency cap applied when work is dequeued. Pending entries are kept in
//! priority order, highest first, FIFO within a priority. The check and the
//! commit of an admission are one atomic step; there is no check-only call.
//!
//! The queue is a cheap, cloneable handle around shared state so that leases
//! can be moved into spawned tasks.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

mod errors;
mod window;

pub use errors::{AdmissionConfigError, AdmissionError, Rejection};
use window::RateWindow;

/// Settings for an [`AdmissionQueue`].
///
/// # Default Values
/// - `max_size`: 100 pending entries
/// - `concurrency`: 10 entries processing at once
/// - `rate_limit`: 100 admissions per `rate_window`
/// - `rate_window`: 60 seconds
/// - `queue_full_retry_after`: 1 second
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Maximum number of pending entries.
    pub max_size: usize,
    /// Maximum number of entries processing concurrently.
    pub concurrency: usize,
    /// Maximum admissions per sliding window.
    pub rate_limit: usize,
    /// Length of the sliding window.
    pub rate_window: Duration,
    /// Retry hint returned when the pending list is full.
    pub queue_full_retry_after: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            concurrency: 10,
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
            queue_full_retry_after: Duration::from_secs(1),
        }
    }
}

impl AdmissionConfig {
    pub(crate) fn validate(&self) -> Result<(), AdmissionConfigError> {
        for (name, value) in [
            ("max_size", self.max_size),
            ("concurrency", self.concurrency),
            ("rate_limit", self.rate_limit),
        ] {
            if value == 0 {
                return Err(AdmissionConfigError::ZeroLimit { name });
            }
        }
        if self.rate_window.is_zero() {
            return Err(AdmissionConfigError::ZeroWindow);
        }
        Ok(())
    }
}

/// Identifier assigned to each admitted entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "EntryId({})", self.0) }
}

/// Lifecycle of a queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    /// Waiting in the priority list.
    Pending,
    /// Dequeued and handed to a handler.
    Processing,
    /// Handler finished successfully.
    Completed,
    /// Handler failed or the lease was dropped unfinished.
    Failed,
}

struct QueueEntry<T> {
    id: EntryId,
    priority: i32,
    enqueued_at: Instant,
    payload: T,
}

struct Inner<T> {
    pending: VecDeque<QueueEntry<T>>,
    processing: HashMap<EntryId, Instant>,
    window: RateWindow,
    next_id: u64,
    completed: u64,
    failed: u64,
}

struct Shared<T> {
    config: AdmissionConfig,
    inner: Mutex<Inner<T>>,
    work: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, id: EntryId, status: EntryStatus) {
        let mut inner = self.lock();
        if inner.processing.remove(&id).is_none() {
            return;
        }
        if status == EntryStatus::Completed {
            inner.completed += 1;
        } else {
            inner.failed += 1;
        }
        drop(inner);
        self.work.notify_one();
    }
}

/// Snapshot of queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Entries waiting to be processed.
    pub pending: usize,
    /// Entries currently being processed.
    pub processing: usize,
    /// Entries whose handler completed.
    pub completed: u64,
    /// Entries whose handler failed.
    pub failed: u64,
    /// Admissions counted in the current rate window.
    pub window_admissions: usize,
}

/// Result of trying to take the head entry.
pub enum Acquire<T> {
    /// The head entry is now processing under this lease.
    Leased(Lease<T>),
    /// The concurrency cap is reached; nothing was dequeued.
    AtCapacity,
    /// No entries are pending.
    Empty,
}

/// Result of [`AdmissionQueue::process`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The handler ran and succeeded.
    Completed(EntryId),
    /// The handler ran and failed with the given message.
    Failed(EntryId, String),
    /// The concurrency cap is reached; try again once a slot frees.
    NotNow,
    /// Nothing was pending.
    Empty,
}

/// Exclusive claim on a processing slot for one entry.
///
/// Dropping a lease without calling [`Lease::complete`] or [`Lease::fail`]
/// releases the slot and counts the entry as failed.
pub struct Lease<T> {
    shared: Arc<Shared<T>>,
    id: EntryId,
    priority: i32,
    waited: Duration,
    payload: Option<T>,
    finished: bool,
}

impl<T> Lease<T> {
    /// Identifier of the leased entry.
    #[must_use]
    pub fn id(&self) -> EntryId { self.id }

    /// Priority the entry was admitted with.
    #[must_use]
    pub fn priority(&self) -> i32 { self.priority }

    /// Time the entry spent pending before it was dequeued.
    #[must_use]
    pub fn waited(&self) -> Duration { self.waited }

    /// Take the entry payload. Returns `None` if already taken.
    pub fn take_payload(&mut self) -> Option<T> { self.payload.take() }

    /// Release the slot and count the entry as completed.
    pub fn complete(mut self) { self.release(EntryStatus::Completed); }

    /// Release the slot and count the entry as failed.
    pub fn fail(mut self) { self.release(EntryStatus::Failed); }

    fn release(&mut self, status: EntryStatus) {
        if !self.finished {
            self.finished = true;
            self.shared.finish(self.id, status);
        }
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) { self.release(EntryStatus::Failed); }
}

/// Cloneable handle to a shared, priority-ordered admission queue.
pub struct AdmissionQueue<T>(Arc<Shared<T>>);

impl<T> Clone for AdmissionQueue<T> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}

impl<T> fmt::Debug for AdmissionQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("config", &self.0.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T> AdmissionQueue<T> {
    /// Create a queue with the given limits.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionConfigError`] if any limit is zero.
    pub fn new(config: AdmissionConfig) -> Result<Self, AdmissionConfigError> {
        config.validate()?;
        Ok(Self(Arc::new(Shared {
            config,
            inner: Mutex::new(Inner {
                pending: VecDeque::with_capacity(config.max_size.min(1024)),
                processing: HashMap::new(),
                window: RateWindow::new(config.rate_limit, config.rate_window),
                next_id: 0,
                completed: 0,
                failed: 0,
            }),
            work: Notify::new(),
        })))
    }

    /// Configured limits.
    #[must_use]
    pub fn config(&self) -> &AdmissionConfig { &self.0.config }

    /// Admit `payload` with the given priority.
    ///
    /// Capacity and rate are checked and the admission recorded under one
    /// lock, so concurrent callers can neither overfill the queue nor
    /// double-count the rate window.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::QueueFull`] when the pending list is at
    /// `max_size` and [`AdmissionError::RateLimited`] when `rate_limit`
    /// admissions already happened within the current window.
    pub fn enqueue(&self, priority: i32, payload: T) -> Result<EntryId, AdmissionError> {
        let config = &self.0.config;
        let now = Instant::now();
        let mut inner = self.0.lock();
        let window = inner.window.state(now);

        if inner.pending.len() >= config.max_size {
            let rejection = Rejection::new(
                inner.window.limit(),
                window.remaining,
                config.queue_full_retry_after,
                now,
            );
            drop(inner);
            return Err(self.reject(AdmissionError::QueueFull {
                max_size: config.max_size,
                rejection,
            }));
        }
        if window.remaining == 0 {
            let rejection = Rejection::new(inner.window.limit(), 0, window.reset_in, now);
            drop(inner);
            return Err(self.reject(AdmissionError::RateLimited(rejection)));
        }

        let id = EntryId(inner.next_id);
        inner.next_id += 1;
        inner.window.record(now);
        let at = inner.pending.partition_point(|e| e.priority >= priority);
        inner.pending.insert(
            at,
            QueueEntry {
                id,
                priority,
                enqueued_at: now,
                payload,
            },
        );
        drop(inner);

        debug!(%id, priority, position = at, "entry admitted");
        self.0.work.notify_one();
        Ok(id)
    }

    fn reject(&self, err: AdmissionError) -> AdmissionError {
        crate::metrics::inc_rejections(err.reason());
        warn!(reason = err.reason(), rejection = ?err.rejection(), "admission rejected");
        err
    }

    /// Dequeue the head entry if the concurrency cap allows it.
    #[must_use]
    pub fn acquire(&self) -> Acquire<T> {
        let mut inner = self.0.lock();
        if inner.processing.len() >= self.0.config.concurrency {
            return Acquire::AtCapacity;
        }
        let Some(entry) = inner.pending.pop_front() else {
            return Acquire::Empty;
        };
        let now = Instant::now();
        inner.processing.insert(entry.id, now);
        drop(inner);

        Acquire::Leased(Lease {
            shared: Arc::clone(&self.0),
            id: entry.id,
            priority: entry.priority,
            waited: now.saturating_duration_since(entry.enqueued_at),
            payload: Some(entry.payload),
            finished: false,
        })
    }

    /// Dequeue the head entry and run `handler` on it.
    ///
    /// Returns [`ProcessOutcome::NotNow`] without dequeuing when the
    /// concurrency cap is reached.
    pub async fn process<F, Fut, E>(&self, handler: F) -> ProcessOutcome
    where
        F: FnOnce(EntryId, T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let mut lease = match self.acquire() {
            Acquire::Leased(lease) => lease,
            Acquire::AtCapacity => return ProcessOutcome::NotNow,
            Acquire::Empty => return ProcessOutcome::Empty,
        };
        let id = lease.id();
        let Some(payload) = lease.take_payload() else {
            return ProcessOutcome::Failed(id, "payload already taken".to_owned());
        };
        match handler(id, payload).await {
            Ok(()) => {
                lease.complete();
                ProcessOutcome::Completed(id)
            }
            Err(e) => {
                lease.fail();
                ProcessOutcome::Failed(id, e.to_string())
            }
        }
    }

    /// Wait until work may be available: an entry was admitted or a
    /// processing slot was released.
    ///
    /// Wake-ups are stored when nobody is waiting, so a single dispatcher
    /// never misses one. With several waiters only one is woken per event.
    pub async fn wait_for_work(&self) { self.0.work.notified().await; }

    /// Zero-based position of a pending entry, or `None` if it is not pending.
    #[must_use]
    pub fn position(&self, id: EntryId) -> Option<usize> {
        self.0.lock().pending.iter().position(|e| e.id == id)
    }

    /// Current status of an entry still tracked by the queue.
    ///
    /// Finished entries are only reflected in the counters of [`Self::stats`].
    #[must_use]
    pub fn status(&self, id: EntryId) -> Option<EntryStatus> {
        let inner = self.0.lock();
        if inner.processing.contains_key(&id) {
            Some(EntryStatus::Processing)
        } else if inner.pending.iter().any(|e| e.id == id) {
            Some(EntryStatus::Pending)
        } else {
            None
        }
    }

    /// Remove a pending entry, returning its payload.
    ///
    /// Entries already processing are unaffected and `None` is returned.
    pub fn cancel(&self, id: EntryId) -> Option<T> {
        let mut inner = self.0.lock();
        let index = inner.pending.iter().position(|e| e.id == id)?;
        let entry = inner.pending.remove(index)?;
        drop(inner);
        debug!(%id, "pending entry cancelled");
        Some(entry.payload)
    }

    /// Drop every pending entry, forget processing slots, and reset counters
    /// and the rate window.
    ///
    /// Outstanding leases become inert: finishing them no longer changes the
    /// counters.
    pub fn clear(&self) {
        let mut inner = self.0.lock();
        inner.pending.clear();
        inner.processing.clear();
        inner.window.clear();
        inner.completed = 0;
        inner.failed = 0;
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize { self.0.lock().pending.len() }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Snapshot the queue counters.
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let mut inner = self.0.lock();
        let window = inner.window.state(Instant::now());
        AdmissionStats {
            pending: inner.pending.len(),
            processing: inner.processing.len(),
            completed: inner.completed,
            failed: inner.failed,
            window_admissions: inner.window.limit() - window.remaining,
        }
    }
}

#[cfg(test)]
mod tests;
