//! Backward pagination across many peers.
//!
//! A [`Cursor`] walks one peer backwards in time. Each page asks for events
//! strictly older than the oldest one seen so far; a short page marks the
//! cursor exhausted. [`MultiCursor`] runs one cursor per peer over the same
//! filters and merges their buffers into a single newest-first stream.

use super::{LoadHandle, LoadRequest, Loader};
use hearth_core::{Event, Filter};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

type OnEvent = Arc<dyn Fn(&Event) + Send + Sync>;

/// Pagination state for one peer.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Normalized peer URL.
    pub peer: String,
    /// Filters every page is built from.
    pub filters: Vec<Filter>,
    /// Oldest `created_at` seen; `None` before the first page.
    pub until: Option<u64>,
    /// Whether the last page came back short.
    pub exhausted: bool,
    in_flight: bool,
    /// Received but not yet taken, newest first.
    buffer: Vec<Event>,
}

impl Cursor {
    /// A fresh cursor for `peer`.
    pub fn new(peer: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            peer: peer.into(),
            filters,
            until: None,
            exhausted: false,
            in_flight: false,
            buffer: Vec::new(),
        }
    }

    /// Filters for the next page of `limit` events.
    ///
    /// Relay `until` is inclusive, so the page bound sits one second below
    /// the oldest event already seen.
    pub fn page(&self, limit: usize) -> Vec<Filter> {
        self.filters
            .iter()
            .map(|filter| {
                let mut filter = filter.clone();
                if let Some(until) = self.until {
                    let bound = until.saturating_sub(1);
                    filter.until = Some(filter.until.map_or(bound, |own| own.min(bound)));
                }
                filter.limit(limit)
            })
            .collect()
    }

    /// Apply a completed page.
    pub fn advance(&mut self, page: &[Event], limit: usize) {
        if let Some(oldest) = page.iter().map(|e| e.created_at).min() {
            self.until = Some(self.until.map_or(oldest, |until| until.min(oldest)));
        }
        if page.len() < limit || self.until == Some(0) {
            self.exhausted = true;
        }
    }

    /// Number of buffered events.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn receive(&mut self, event: &Event) {
        if self.buffer.iter().any(|held| held.id == event.id) {
            return;
        }
        let at = self
            .buffer
            .partition_point(|held| held.version_cmp(event).is_gt());
        self.buffer.insert(at, event.clone());
    }
}

struct CursorSet {
    cursors: Vec<Cursor>,
    /// Ids already handed out by `take`.
    taken: HashSet<String>,
}

/// One cursor per peer, merged newest first.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct MultiCursor {
    state: Arc<Mutex<CursorSet>>,
    in_flight: Arc<watch::Sender<usize>>,
    on_event: Option<OnEvent>,
}

impl MultiCursor {
    /// One cursor per peer over the same filters.
    pub fn new(peers: &[String], filters: Vec<Filter>) -> Self {
        let cursors = peers
            .iter()
            .map(|peer| Cursor::new(peer.clone(), filters.clone()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(CursorSet {
                cursors,
                taken: HashSet::new(),
            })),
            in_flight: Arc::new(watch::Sender::new(0)),
            on_event: None,
        }
    }

    /// Also hand every received event to `f`.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    /// Number of cursors.
    pub fn len(&self) -> usize {
        self.state.lock().cursors.len()
    }

    /// Whether there are no cursors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every cursor is exhausted and drained.
    pub fn is_exhausted(&self) -> bool {
        self.state
            .lock()
            .cursors
            .iter()
            .all(|c| c.exhausted && c.buffer.is_empty())
    }

    /// Snapshot of the cursors.
    pub fn cursors(&self) -> Vec<Cursor> {
        self.state.lock().cursors.clone()
    }

    /// Watch the number of page loads in flight.
    pub fn in_flight(&self) -> watch::Receiver<usize> {
        self.in_flight.subscribe()
    }

    /// Request the next page of `n` from every idle, unexhausted cursor
    /// whose buffer holds fewer than `n` events.
    ///
    /// Cursors that have paged least deep go first.
    pub fn load(&self, n: usize, loader: &Loader) -> Vec<LoadHandle> {
        let mut pages: Vec<(usize, Option<u64>, String, Vec<Filter>)> = {
            let mut state = self.state.lock();
            state
                .cursors
                .iter_mut()
                .enumerate()
                .filter(|(_, c)| !c.exhausted && !c.in_flight && c.buffer.len() < n)
                .map(|(i, c)| {
                    c.in_flight = true;
                    (i, c.until, c.peer.clone(), c.page(n))
                })
                .collect()
        };
        // None (not yet paged) sorts last; reverse puts it first.
        pages.sort_by_key(|(_, until, _, _)| *until);
        pages.reverse();

        self.in_flight.send_modify(|count| *count += pages.len());

        pages
            .into_iter()
            .map(|(index, _, peer, filters)| {
                let state = self.state.clone();
                let on_event = self.on_event.clone();
                let closing = self.state.clone();
                let in_flight = self.in_flight.clone();

                loader.load(
                    LoadRequest::new([peer], filters)
                        .on_event(move |event, _| {
                            if let Some(cursor) = state.lock().cursors.get_mut(index) {
                                cursor.receive(event);
                            }
                            if let Some(on_event) = &on_event {
                                on_event(event);
                            }
                        })
                        .on_close(move |page| {
                            if let Some(cursor) = closing.lock().cursors.get_mut(index) {
                                cursor.in_flight = false;
                                cursor.advance(page, n);
                            }
                            in_flight.send_modify(|count| *count = count.saturating_sub(1));
                        }),
                )
            })
            .collect()
    }

    /// Take up to `n` of the newest buffered events across all cursors,
    /// skipping ids already taken, then top up cursors that ran low.
    pub fn take(&self, n: usize, loader: &Loader) -> (Vec<LoadHandle>, Vec<Event>) {
        let events = self.drain(n);
        let handles = self.load(n, loader);
        (handles, events)
    }

    fn drain(&self, n: usize) -> Vec<Event> {
        let mut state = self.state.lock();
        let CursorSet { cursors, taken } = &mut *state;

        let mut events: Vec<Event> = Vec::with_capacity(n);
        while events.len() < n {
            // Newest head across all buffers
            let Some(best) = cursors
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.buffer.first().map(|e| (i, e)))
                .max_by(|(_, a), (_, b)| a.version_cmp(b))
                .map(|(i, _)| i)
            else {
                break;
            };

            let event = cursors[best].buffer.remove(0);
            if taken.insert(event.id.clone()) {
                events.push(event);
            }
        }

        // Drop copies of taken events still sitting in other buffers
        for cursor in cursors.iter_mut() {
            cursor.buffer.retain(|e| !taken.contains(&e.id));
        }

        events
    }
}
