//! Derived state from accepted events.
//!
//! The [`Projections`] registry hands every accepted event to the handlers
//! registered for its kind, and buffers it for global handlers that prefer
//! batches. Container events are opened by an optional [`Unwrapper`]; the
//! payload goes back onto the same queue, so per-kind handlers see plaintext
//! and formerly-encrypted events alike.
//!
//! ```text
//! ingest ──▶ queue ──▶ unwrap? ──yes──▶ rumor ──┐
//!              ▲                                │
//!              └────────────────────────────────┘
//!              │
//!              ▼
//!        kind handlers ──▶ global batch (size or window) ──▶ global handlers
//! ```
//!
//! Each event id is dispatched at most once per registry. Handlers still
//! guard their own state with [`HighWaterMarks`] where an update must not
//! regress.

mod builtin;
mod unwrap;

pub use builtin::{HighWaterMarks, TopicIndex, TopicStats};
pub use unwrap::{Decryptor, KeyLookup, Unwrapped, Unwrapper};

use crate::config::EngineConfig;
use crate::schedule::Batcher;
use hearth_core::Event;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Instant;

type KindHandler = Box<dyn FnMut(&Event) + Send>;
type GlobalHandler = Box<dyn FnMut(&[Event]) + Send>;

/// Result of one [`Projections::push`].
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Events dispatched to handlers, rumors included.
    pub dispatched: usize,
    /// Payloads opened from containers during this push.
    pub rumors: Vec<Event>,
    /// Set when the global batch window was armed; call
    /// [`Projections::flush_due`] at this instant.
    pub flush_at: Option<Instant>,
}

/// Per-kind and global handler registry.
///
/// Handlers run on the caller's thread while the registry is borrowed, so a
/// handler must not push back into the registry that invoked it.
pub struct Projections {
    handlers: HashMap<u16, Vec<KindHandler>>,
    globals: Vec<GlobalHandler>,
    unwrapper: Option<Unwrapper>,
    queue: VecDeque<Event>,
    dispatched: HashSet<String>,
    batch: Batcher<Event>,
    batch_size: usize,
}

impl Projections {
    /// Create an empty registry.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            globals: Vec::new(),
            unwrapper: None,
            queue: VecDeque::new(),
            dispatched: HashSet::new(),
            batch: Batcher::new(config.global_batch_window),
            batch_size: config.global_batch_size.max(1),
        }
    }

    /// Call `f` for every dispatched event of `kind`, after earlier
    /// handlers for the same kind.
    pub fn add_handler<F>(&mut self, kind: u16, f: F)
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(f));
    }

    /// Call `f` with batches of dispatched events of any kind.
    pub fn add_global_handler<F>(&mut self, f: F)
    where
        F: FnMut(&[Event]) + Send + 'static,
    {
        self.globals.push(Box::new(f));
    }

    /// Open container events with `unwrapper` before dispatch.
    pub fn set_unwrapper(&mut self, unwrapper: Unwrapper) {
        self.unwrapper = Some(unwrapper);
    }

    /// Whether `id` has been dispatched.
    pub fn is_dispatched(&self, id: &str) -> bool {
        self.dispatched.contains(id)
    }

    /// Events waiting for global handlers.
    pub fn pending_global(&self) -> usize {
        self.batch.len()
    }

    /// Dispatch `event` and any payloads it unwraps to.
    pub fn push(&mut self, event: Event, now: Instant) -> Dispatch {
        let mut result = Dispatch::default();
        let armed = self.batch.deadline();
        self.queue.push_back(event);

        while let Some(event) = self.queue.pop_front() {
            if !self.dispatched.insert(event.id.clone()) {
                continue;
            }

            if let Some(unwrapper) = &self.unwrapper
                && unwrapper.handles(&event)
                && let Unwrapped::Rumor(rumor) = unwrapper.unwrap(&event)
            {
                result.rumors.push(rumor.clone());
                self.queue.push_back(rumor);
            }

            if let Some(handlers) = self.handlers.get_mut(&event.kind) {
                for handler in handlers.iter_mut() {
                    handler(&event);
                }
            }
            metrics::counter!("projection_events_dispatched_total").increment(1);
            result.dispatched += 1;

            if !self.globals.is_empty() {
                self.batch.push(event, now);
            }
        }

        while self.batch.len() >= self.batch_size {
            self.flush_global(now);
        }
        result.flush_at = self.batch.deadline().filter(|d| Some(*d) != armed);

        result
    }

    /// Flush the global batch if its window has elapsed.
    ///
    /// Returns whether anything was delivered.
    pub fn flush_due(&mut self, now: Instant) -> bool {
        if !self.batch.is_due(now) {
            return false;
        }
        self.flush_all(now)
    }

    /// Deliver everything buffered for global handlers now.
    pub fn flush(&mut self) -> bool {
        self.flush_all(Instant::now())
    }

    fn flush_all(&mut self, now: Instant) -> bool {
        let mut delivered = false;
        while !self.batch.is_empty() {
            self.flush_global(now);
            delivered = true;
        }
        delivered
    }

    /// Deliver up to one batch, carrying the rest over.
    fn flush_global(&mut self, now: Instant) {
        let mut events = self.batch.take();
        if events.len() > self.batch_size {
            let rest = events.split_off(self.batch_size);
            self.batch.extend(rest, now);
        }

        tracing::trace!(count = events.len(), "Global projection batch");
        for handler in self.globals.iter_mut() {
            handler(&events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{event, note, pubkey};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> Projections {
        Projections::new(&EngineConfig::default())
    }

    fn counter() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&Event) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &Event| sink.lock().push(e.id.clone()))
    }

    // =========================================================================
    // Per-kind handlers
    // =========================================================================

    #[test]
    fn test_handlers_by_kind_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut projections = registry();
        for tag in ["first", "second"] {
            let order = order.clone();
            projections.add_handler(1, move |_| order.lock().push(tag));
        }
        let (other, handler) = counter();
        projections.add_handler(7, handler);

        projections.push(note(1, 100), Instant::now());

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(other.lock().is_empty());
    }

    #[test]
    fn test_redelivery_dispatches_once() {
        let mut projections = registry();
        let (seen, handler) = counter();
        projections.add_handler(1, handler);

        let now = Instant::now();
        assert_eq!(projections.push(note(1, 100), now).dispatched, 1);
        assert_eq!(projections.push(note(1, 100), now).dispatched, 0);

        assert_eq!(seen.lock().len(), 1);
        assert!(projections.is_dispatched(&note(1, 100).id));
    }

    // =========================================================================
    // Global handlers
    // =========================================================================

    #[test]
    fn test_global_batches_by_size() {
        let config = EngineConfig {
            global_batch_size: 2,
            ..Default::default()
        };
        let mut projections = Projections::new(&config);
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        projections.add_global_handler(move |events| sink.lock().push(events.len()));

        let now = Instant::now();
        for n in 1..=5 {
            projections.push(note(n, 100), now);
        }
        assert_eq!(*batches.lock(), vec![2, 2]);
        assert_eq!(projections.pending_global(), 1);

        assert!(projections.flush());
        assert_eq!(*batches.lock(), vec![2, 2, 1]);
    }

    #[test]
    fn test_global_batches_by_window() {
        let mut projections = registry();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        projections.add_global_handler(move |events| sink.lock().push(events.len()));

        let now = Instant::now();
        let flush_at = projections.push(note(1, 100), now).flush_at;
        assert_eq!(flush_at, Some(now + Duration::from_millis(300)));
        assert!(projections.push(note(2, 100), now).flush_at.is_none());

        assert!(!projections.flush_due(now + Duration::from_millis(299)));
        assert!(projections.flush_due(now + Duration::from_millis(300)));
        assert_eq!(*batches.lock(), vec![2]);
    }

    #[test]
    fn test_no_global_handlers_buffers_nothing() {
        let mut projections = registry();
        let dispatch = projections.push(event(1, 30_000, &pubkey('b'), 5, vec![]), Instant::now());
        assert_eq!(dispatch.dispatched, 1);
        assert!(dispatch.flush_at.is_none());
        assert_eq!(projections.pending_global(), 0);
    }
}
