//! Timer-driven buffers.
//!
//! The engine batches work in three places (repository diffs, the request
//! queue, global projection handlers) and defers feed notes in two more.
//! The buffers here hold the pending items and their deadlines; owners arm a
//! `tokio::time::sleep_until` on the deadline returned when a buffer goes
//! from empty to non-empty. Using tokio's clock means tests can run on
//! paused, virtual time.

use std::time::Duration;
use tokio::time::Instant;

/// Buffers items until a fixed window after the first one arrived.
#[derive(Debug)]
pub struct Batcher<T> {
    window: Duration,
    pending: Vec<T>,
    deadline: Option<Instant>,
}

impl<T> Batcher<T> {
    /// Create a batcher that flushes `window` after its first pending item.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            deadline: None,
        }
    }

    /// Add an item. Returns the deadline if this push armed the batch.
    pub fn push(&mut self, item: T, now: Instant) -> Option<Instant> {
        self.pending.push(item);
        self.arm(now)
    }

    /// Add several items. Returns the deadline if this call armed the batch.
    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I, now: Instant) -> Option<Instant> {
        self.pending.extend(items);
        if self.pending.is_empty() {
            return None;
        }
        self.arm(now)
    }

    fn arm(&mut self, now: Instant) -> Option<Instant> {
        if self.deadline.is_some() {
            return None;
        }
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        Some(deadline)
    }

    /// Whether the armed deadline has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// The armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take everything pending and disarm.
    pub fn take(&mut self) -> Vec<T> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Items each released at their own deadline.
#[derive(Debug)]
pub struct DelayQueue<T> {
    entries: Vec<(Instant, T)>,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> DelayQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `item` until `deadline`.
    pub fn push(&mut self, item: T, deadline: Instant) {
        self.entries.push((deadline, item));
    }

    /// Remove and return every item whose deadline has passed, oldest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due: Vec<(Instant, T)> = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].0 <= now {
                due.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, item)| item).collect()
    }

    /// Remove the first item matching `predicate`, regardless of deadline.
    pub fn remove_where<F: Fn(&T) -> bool>(&mut self, predicate: F) -> Option<T> {
        let index = self.entries.iter().position(|(_, item)| predicate(item))?;
        Some(self.entries.swap_remove(index).1)
    }

    /// Whether an item matching `predicate` is still held.
    pub fn contains_where<F: Fn(&T) -> bool>(&self, predicate: F) -> bool {
        self.entries.iter().any(|(_, item)| predicate(item))
    }

    /// The earliest deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(deadline, _)| *deadline).min()
    }

    /// Number of held items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
