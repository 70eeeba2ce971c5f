//! Time-windowed coalescing of incremental items.

use std::{collections::VecDeque, pin::Pin, time::Duration};

use tokio::time::{Instant, Sleep, sleep};

/// Micro-batch settings.
///
/// # Default Values
/// - `window`: 250 milliseconds
/// - `max_size`: 50 items
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    /// Accumulation window opened by the first item after a flush.
    pub window: Duration,
    /// Items kept per batch; older items are dropped first.
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(250),
            max_size: 50,
        }
    }
}

impl BatchConfig {
    /// Keep `max_size` at or above one.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self
    }
}

/// Buffer that releases items at most once per window.
///
/// The first item pushed into an empty window schedules a single flush;
/// further pushes only append. When the buffer exceeds `max_size` the oldest
/// items are discarded.
#[derive(Debug)]
pub struct MicroBatcher<T> {
    config: BatchConfig,
    buffer: VecDeque<T>,
    deadline: Pin<Box<Sleep>>,
    scheduled: bool,
    dropped: u64,
}

impl<T> MicroBatcher<T> {
    /// Create an empty batcher.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        let config = config.normalized();
        Self {
            config,
            buffer: VecDeque::with_capacity(config.max_size),
            deadline: Box::pin(sleep(config.window)),
            scheduled: false,
            dropped: 0,
        }
    }

    /// Append one item.
    pub fn push(&mut self, item: T) {
        self.buffer.push_back(item);
        while self.buffer.len() > self.config.max_size {
            self.buffer.pop_front();
            self.dropped += 1;
        }
        if !self.scheduled {
            self.deadline
                .as_mut()
                .reset(Instant::now() + self.config.window);
            self.scheduled = true;
        }
    }

    /// Append several items.
    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.push(item);
        }
    }

    /// Wait for the scheduled flush and take the batch.
    ///
    /// Pending forever while no flush is scheduled. Cancel safe.
    pub async fn ready(&mut self) -> Vec<T> {
        self.due().await;
        self.flush()
    }

    /// Wait until the scheduled flush is due, leaving the items buffered.
    ///
    /// Items pushed after this resolves join the same batch until it is
    /// taken. Pending forever while no flush is scheduled. Cancel safe.
    pub async fn due(&mut self) {
        if !self.scheduled {
            std::future::pending::<()>().await;
        }
        self.deadline.as_mut().await;
    }

    /// Take everything buffered now and cancel the scheduled flush.
    pub fn flush(&mut self) -> Vec<T> {
        self.scheduled = false;
        self.buffer.drain(..).collect()
    }

    /// Discard the buffer and cancel the scheduled flush.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scheduled = false;
    }

    /// Items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize { self.buffer.len() }

    /// Returns `true` when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }

    /// Returns `true` while a flush is scheduled.
    #[must_use]
    pub fn is_scheduled(&self) -> bool { self.scheduled }

    /// Items discarded by the drop-oldest policy since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 { self.dropped }
}
