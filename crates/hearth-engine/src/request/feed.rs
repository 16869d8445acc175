//! Paginated feeds with reply grouping.
//!
//! [`FeedBuilder`] is the synchronous core: it turns batches of notes into a
//! deduplicated, newest-first list of [`FeedItem`]s, grouping replies under
//! their parents. Two timing rules keep out-of-order delivery from hurting
//! the result:
//!
//! - Orphans. A reply whose parent is unknown is shown on its own right away
//!   and remembered for the orphan window. If the parent turns up inside the
//!   window the reply moves under it; afterwards it stays where it is.
//! - Ancient notes. When a batch mixes recent notes with notes older than the
//!   recency cutoff, the old ones are held back for the ancient window so a
//!   peer dumping a stale backlog does not push fresh notes out of view.
//!
//! [`FeedLoader`] drives a [`MultiCursor`] through the [`Loader`], feeds the
//! builder, loads reply parents, optionally listens for new notes, and
//! publishes the feed on a watch channel.

use super::{LoadHandle, LoadRequest, Loader, MultiCursor};
use crate::config::EngineConfig;
use crate::relay::normalize_peer_url;
use crate::schedule::DelayQueue;
use crate::{Error, Result};
use hearth_core::{Event, Filter};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// One top-level feed entry and the replies grouped under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    /// The note shown at the top level.
    pub event: Event,
    /// Oldest first.
    pub replies: Vec<Event>,
}

impl FeedItem {
    fn new(event: Event) -> Self {
        Self {
            event,
            replies: Vec::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.event.id == id || self.replies.iter().any(|r| r.id == id)
    }

    fn attach(&mut self, reply: Event) {
        if self.contains(&reply.id) {
            return;
        }
        let at = self
            .replies
            .partition_point(|held| held.version_cmp(&reply).is_lt());
        self.replies.insert(at, reply);
    }
}

/// Assembles a feed from batches of notes.
#[derive(Debug)]
pub struct FeedBuilder {
    items: Vec<FeedItem>,
    /// Every id placed in the feed, top-level or grouped.
    placed: HashSet<String>,
    /// Resolved reply parents by id.
    parents: std::collections::HashMap<String, Event>,
    /// Standalone replies that may still move under their parent.
    orphans: DelayQueue<Event>,
    ancient: DelayQueue<Event>,
    orphan_defer: Duration,
    ancient_defer: Duration,
    recency_cutoff: Duration,
}

impl FeedBuilder {
    /// Create an empty builder with the configured windows.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            items: Vec::new(),
            placed: HashSet::new(),
            parents: Default::default(),
            orphans: DelayQueue::new(),
            ancient: DelayQueue::new(),
            orphan_defer: config.orphan_defer,
            ancient_defer: config.ancient_defer,
            recency_cutoff: config.recency_cutoff,
        }
    }

    /// The feed, newest first.
    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    /// Whether `id` is placed in the feed.
    pub fn contains(&self, id: &str) -> bool {
        self.placed.contains(id)
    }

    /// Whether `id` is a resolved parent or placed in the feed.
    pub fn knows(&self, id: &str) -> bool {
        self.parents.contains_key(id) || self.placed.contains(id)
    }

    /// Notes still held back as ancient.
    pub fn deferred(&self) -> usize {
        self.ancient.len()
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.orphans.next_deadline(), self.ancient.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Add a batch of notes. `wall_now` is the current Unix time.
    ///
    /// Returns whether the feed changed.
    pub fn push(&mut self, notes: Vec<Event>, now: Instant, wall_now: u64) -> bool {
        let cutoff = wall_now.saturating_sub(self.recency_cutoff.as_secs());
        let has_recent = notes.iter().any(|e| e.created_at >= cutoff);

        let (ancient, ok): (Vec<Event>, Vec<Event>) = notes
            .into_iter()
            .partition(|e| has_recent && e.created_at < cutoff);

        if !ancient.is_empty() {
            metrics::counter!("feed_ancient_deferred_total").increment(ancient.len() as u64);
            let deadline = now + self.ancient_defer;
            for event in ancient {
                self.ancient.push(event, deadline);
            }
        }

        self.add(ok, now)
    }

    /// Add notes without ancient deferral.
    pub fn add(&mut self, notes: Vec<Event>, now: Instant) -> bool {
        let mut changed = false;
        for note in notes {
            changed |= self.place(note, now);
        }
        if changed {
            self.sort();
        }
        changed
    }

    /// Record a resolved reply parent, regrouping any orphans waiting on it.
    pub fn add_parent(&mut self, parent: Event) -> bool {
        let id = parent.id.clone();
        self.parents.insert(id.clone(), parent);
        let changed = self.regroup(&id);
        if changed {
            self.sort();
        }
        changed
    }

    /// Release due timers. Returns whether the feed changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        // Orphans past their window stay standalone for good.
        self.orphans.pop_due(now);

        let released = self.ancient.pop_due(now);
        if released.is_empty() {
            return false;
        }
        self.add(released, now)
    }

    fn place(&mut self, note: Event, now: Instant) -> bool {
        if self.placed.contains(&note.id) {
            return false;
        }
        metrics::counter!("feed_notes_total").increment(1);

        let id = note.id.clone();
        let parent_id = note.reply_id().map(str::to_string);
        let resolved = parent_id
            .as_deref()
            .and_then(|p| self.parents.get(p))
            .cloned();

        match (parent_id, resolved) {
            (Some(parent_id), _) if self.placed.contains(&parent_id) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.contains(&parent_id)) {
                    item.attach(note);
                }
                self.placed.insert(id.clone());
            }
            (Some(_), Some(parent)) => {
                self.placed.insert(parent.id.clone());
                self.placed.insert(id.clone());
                let mut item = FeedItem::new(parent);
                item.attach(note);
                self.items.push(item);
            }
            (Some(_), None) => {
                metrics::counter!("feed_orphans_deferred_total").increment(1);
                self.placed.insert(id.clone());
                self.orphans.push(note.clone(), now + self.orphan_defer);
                self.items.push(FeedItem::new(note));
            }
            (None, _) => {
                self.placed.insert(id.clone());
                self.items.push(FeedItem::new(note));
            }
        }

        // A note can itself be the parent some orphan is waiting for.
        self.regroup(&id);
        true
    }

    /// Move orphans replying to `parent_id` under it.
    fn regroup(&mut self, parent_id: &str) -> bool {
        let mut changed = false;

        while let Some(orphan) = self
            .orphans
            .remove_where(|o| o.reply_id() == Some(parent_id))
        {
            // Lift the orphan (and anything grouped under it) out of the feed
            let Some(index) = self.items.iter().position(|i| i.event.id == orphan.id) else {
                continue;
            };
            let lifted = self.items.remove(index);

            let target = match self.items.iter().position(|i| i.contains(parent_id)) {
                Some(target) => target,
                None => {
                    let Some(parent) = self.parents.get(parent_id).cloned() else {
                        // Parent not available as an event; put the orphan back.
                        self.items.push(lifted);
                        continue;
                    };
                    self.placed.insert(parent.id.clone());
                    self.items.push(FeedItem::new(parent));
                    self.items.len() - 1
                }
            };

            let item = &mut self.items[target];
            item.attach(lifted.event);
            for reply in lifted.replies {
                item.attach(reply);
            }
            changed = true;
        }

        changed
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| b.event.version_cmp(&a.event));
    }
}

/// What a [`FeedLoader`] pages through.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Peer URLs.
    pub peers: Vec<String>,
    /// Filters shared by every peer's cursor.
    pub filters: Vec<Filter>,
    /// Also subscribe to new notes, collected in a buffer.
    pub listen: bool,
    /// Load reply parents of delivered notes.
    pub load_parents: bool,
}

impl FeedOptions {
    /// Page `filters` from `peers`, loading parents but not listening.
    pub fn new(peers: Vec<String>, filters: Vec<Filter>) -> Self {
        Self {
            peers,
            filters,
            listen: false,
            load_parents: true,
        }
    }
}

struct FeedInner {
    loader: Loader,
    opts: FeedOptions,
    cursor: MultiCursor,
    builder: Mutex<FeedBuilder>,
    feed: watch::Sender<Vec<FeedItem>>,
    buffer: Mutex<Vec<Event>>,
    /// Parent ids already requested.
    requested: Mutex<HashSet<String>>,
    handles: Mutex<Vec<LoadHandle>>,
    /// Deadline of the currently armed timer task.
    armed: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    halt: Notify,
}

/// A feed paged from many peers.
///
/// Cloning is cheap; clones share the same feed.
#[derive(Clone)]
pub struct FeedLoader {
    inner: Arc<FeedInner>,
}

impl FeedLoader {
    /// Start a feed: the first page is requested immediately.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(loader: Loader, mut opts: FeedOptions, config: &EngineConfig) -> Self {
        let mut peers: Vec<String> = Vec::new();
        for peer in &opts.peers {
            match normalize_peer_url(peer) {
                Ok(url) if !peers.contains(&url) => peers.push(url),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping peer: {}", e),
            }
        }
        opts.peers = peers;

        let since = hearth_core::now();
        let listen = opts.listen && opts.filters.iter().all(|f| f.until.is_none());

        let inner = Arc::new_cyclic(|weak: &Weak<FeedInner>| {
            let on_note = weak.clone();
            let cursor = MultiCursor::new(&opts.peers, opts.filters.clone()).on_event(
                move |event| {
                    if let Some(inner) = on_note.upgrade() {
                        FeedLoader { inner }.load_parents(std::slice::from_ref(event));
                    }
                },
            );
            FeedInner {
                loader,
                cursor,
                builder: Mutex::new(FeedBuilder::new(config)),
                feed: watch::Sender::new(Vec::new()),
                buffer: Mutex::new(Vec::new()),
                requested: Mutex::new(HashSet::new()),
                handles: Mutex::new(Vec::new()),
                armed: Mutex::new(None),
                stopped: AtomicBool::new(false),
                halt: Notify::new(),
                opts,
            }
        });

        let feed = FeedLoader { inner };

        if listen {
            let filters = feed
                .inner
                .opts
                .filters
                .iter()
                .map(|f| f.clone().since(since))
                .collect();
            let weak = Arc::downgrade(&feed.inner);
            let handle = feed.inner.loader.load(
                LoadRequest::new(&feed.inner.opts.peers, filters)
                    .live()
                    .on_event(move |event, _| {
                        if let Some(inner) = weak.upgrade() {
                            let feed = FeedLoader { inner };
                            feed.load_parents(std::slice::from_ref(event));
                            feed.inner.buffer.lock().push(event.clone());
                        }
                    }),
            );
            feed.inner.handles.lock().push(handle);
        }

        let handles = feed
            .inner
            .cursor
            .load(config.feed_page_size, &feed.inner.loader);
        feed.track(handles);

        tracing::debug!(
            peers = feed.inner.opts.peers.len(),
            listen,
            "Feed started"
        );
        feed
    }

    /// Add the next `n` notes to the feed.
    ///
    /// Waits until enough outstanding page loads have finished that taking
    /// now will not interleave badly.
    pub async fn load(&self, n: usize) -> Result<()> {
        self.ready().await?;

        let (handles, notes) = self.inner.cursor.take(n, &self.inner.loader);
        self.track(handles);

        let changed =
            self.inner
                .builder
                .lock()
                .push(notes, Instant::now(), hearth_core::now());
        if changed {
            self.publish();
        }
        self.arm();
        Ok(())
    }

    /// Move listened notes into the feed.
    pub fn load_buffer(&self) {
        let buffered = std::mem::take(&mut *self.inner.buffer.lock());
        if buffered.is_empty() {
            return;
        }
        let changed = self.inner.builder.lock().add(buffered, Instant::now());
        if changed {
            self.publish();
        }
        self.arm();
    }

    /// Number of listened notes waiting for [`load_buffer`](Self::load_buffer).
    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Stop all loads. Already delivered notes stay in the feed.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.halt.notify_waiters();
        for handle in self.inner.handles.lock().drain(..) {
            handle.close();
        }
        tracing::debug!("Feed stopped");
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Whether every cursor has run dry.
    pub fn is_exhausted(&self) -> bool {
        self.inner.cursor.is_exhausted()
    }

    /// Watch the feed.
    pub fn subscribe(&self) -> watch::Receiver<Vec<FeedItem>> {
        self.inner.feed.subscribe()
    }

    /// The current feed, newest first.
    pub fn items(&self) -> Vec<FeedItem> {
        self.inner.feed.borrow().clone()
    }

    /// Request the unresolved reply parents of `notes`.
    pub fn load_parents(&self, notes: &[Event]) {
        if !self.inner.opts.load_parents || self.is_stopped() {
            return;
        }

        let ids: Vec<String> = {
            let builder = self.inner.builder.lock();
            let mut requested = self.inner.requested.lock();
            notes
                .iter()
                .filter_map(Event::reply_id)
                .filter(|id| !builder.knows(id))
                .filter(|id| requested.insert(id.to_string()))
                .map(str::to_string)
                .collect()
        };
        if ids.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.loader.load(
            LoadRequest::new(&self.inner.opts.peers, Filter::for_ids_or_addresses(&ids)).on_event(
                move |parent, _| {
                    if let Some(inner) = weak.upgrade() {
                        let feed = FeedLoader { inner };
                        let changed = feed
                            .inner
                            .builder
                            .lock()
                            .add_parent(parent.clone());
                        if changed {
                            feed.publish();
                        }
                        feed.arm();
                    }
                },
            ),
        );
        self.track(vec![handle]);
    }

    async fn ready(&self) -> Result<()> {
        let halted = self.inner.halt.notified();
        tokio::pin!(halted);
        halted.as_mut().enable();
        if self.is_stopped() {
            return Err(Error::Stopped);
        }

        // Wait for at least a fifth of the cursors' current pages.
        let total = self.inner.cursor.len();
        let allowed = total - total.div_ceil(5);
        let mut in_flight = self.inner.cursor.in_flight();
        tokio::select! {
            ready = in_flight.wait_for(|count| *count <= allowed) => {
                ready.map_err(|_| Error::Stopped)?;
                Ok(())
            }
            _ = &mut halted => Err(Error::Stopped),
        }
    }

    fn track(&self, handles: Vec<LoadHandle>) {
        let mut held = self.inner.handles.lock();
        held.retain(|h| !h.is_done());
        if self.is_stopped() {
            for handle in handles {
                handle.close();
            }
        } else {
            held.extend(handles);
        }
    }

    fn publish(&self) {
        let items = self.inner.builder.lock().items().to_vec();
        self.inner.feed.send_replace(items);
    }

    /// Make sure a timer task is waiting for the builder's next deadline.
    fn arm(&self) {
        let Some(deadline) = self.inner.builder.lock().next_deadline() else {
            return;
        };
        {
            let mut armed = self.inner.armed.lock();
            if armed.is_some_and(|at| at <= deadline) {
                return;
            }
            *armed = Some(deadline);
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else { return };
            let feed = FeedLoader { inner };
            {
                let mut armed = feed.inner.armed.lock();
                if *armed == Some(deadline) {
                    *armed = None;
                }
            }
            let changed = feed.inner.builder.lock().tick(Instant::now());
            if changed {
                feed.publish();
            }
            feed.arm();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Ingest;
    use crate::testing::{MockRelays, id, note, reply, wait};

    const A: &str = "wss://a.example";
    const B: &str = "wss://b.example";

    fn builder() -> FeedBuilder {
        FeedBuilder::new(&EngineConfig::default())
    }

    fn top_ids(items: &[FeedItem]) -> Vec<String> {
        items.iter().map(|i| i.event.id.clone()).collect()
    }

    // =========================================================================
    // Ordering and dedupe
    // =========================================================================

    #[test]
    fn test_sorted_newest_first_and_deduped() {
        let now = Instant::now();
        let mut feed = builder();
        feed.push(vec![note(2, 90), note(1, 100)], now, 1_000);
        feed.push(vec![note(1, 100), note(3, 95)], now, 1_000);

        assert_eq!(top_ids(feed.items()), vec![id(1), id(3), id(2)]);
    }

    #[test]
    fn test_reply_to_known_parent_is_grouped() {
        let now = Instant::now();
        let mut feed = builder();
        feed.push(vec![note(3, 100)], now, 1_000);
        feed.push(vec![reply(5, 110, &id(3))], now, 1_000);

        assert_eq!(top_ids(feed.items()), vec![id(3)]);
        assert_eq!(feed.items()[0].replies[0].id, id(5));
    }

    #[test]
    fn test_reply_with_resolved_parent_shows_parent() {
        let now = Instant::now();
        let mut feed = builder();
        feed.add_parent(note(3, 100));
        feed.push(vec![reply(5, 110, &id(3))], now, 1_000);

        assert_eq!(top_ids(feed.items()), vec![id(3)]);
        assert_eq!(feed.items()[0].replies.len(), 1);
    }

    // =========================================================================
    // Orphans
    // =========================================================================

    #[test]
    fn test_orphan_standalone_then_regrouped_in_window() {
        let now = Instant::now();
        let mut feed = builder();
        feed.push(vec![reply(5, 110, &id(3))], now, 1_000);
        assert_eq!(top_ids(feed.items()), vec![id(5)]);

        let later = now + Duration::from_millis(1000);
        feed.tick(later);
        assert!(feed.add_parent(note(3, 100)));

        assert_eq!(top_ids(feed.items()), vec![id(3)]);
        assert_eq!(feed.items()[0].replies[0].id, id(5));
    }

    #[test]
    fn test_orphan_parent_arriving_as_note_regroups() {
        let now = Instant::now();
        let mut feed = builder();
        feed.push(vec![reply(5, 110, &id(3))], now, 1_000);
        feed.push(vec![note(3, 100)], now + Duration::from_millis(500), 1_000);

        assert_eq!(top_ids(feed.items()), vec![id(3)]);
        assert_eq!(feed.items()[0].replies[0].id, id(5));
    }

    #[test]
    fn test_orphan_stays_standalone_after_window() {
        let now = Instant::now();
        let mut feed = builder();
        feed.push(vec![reply(5, 110, &id(3))], now, 1_000);

        let later = now + Duration::from_millis(1600);
        feed.tick(later);
        assert!(!feed.add_parent(note(3, 100)));
        assert_eq!(top_ids(feed.items()), vec![id(5)]);
        assert!(feed.next_deadline().is_none());
    }

    // =========================================================================
    // Ancient notes
    // =========================================================================

    #[test]
    fn test_ancient_deferred_only_in_recent_batch() {
        let now = Instant::now();
        let wall = 100_000;
        let cutoff = wall - 6 * 3600;

        let mut feed = builder();
        feed.push(vec![note(1, wall - 10), note(2, cutoff - 100)], now, wall);
        assert_eq!(top_ids(feed.items()), vec![id(1)]);
        assert_eq!(feed.deferred(), 1);

        assert!(!feed.tick(now + Duration::from_secs(3)));
        assert!(feed.tick(now + Duration::from_secs(4)));
        assert_eq!(top_ids(feed.items()), vec![id(1), id(2)]);

        // An all-old batch is not deferred
        let mut feed = builder();
        feed.push(vec![note(3, cutoff - 100)], now, wall);
        assert_eq!(feed.items().len(), 1);
    }

    // =========================================================================
    // Loader
    // =========================================================================

    fn loader(relays: &MockRelays) -> Loader {
        let ingest: Arc<dyn Ingest> = Arc::new(|_: &Event, _: &str| true);
        Loader::new(Arc::new(relays.clone()), ingest, &EngineConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_merges_peers() {
        let relays = MockRelays::new();
        relays.add(A, [note(1, 100), note(2, 90)]);
        relays.add(B, [note(1, 100), note(2, 90)]);

        let feed = FeedLoader::new(
            loader(&relays),
            FeedOptions::new(vec![A.to_string(), B.to_string()], vec![Filter::new().kinds([1])]),
            &EngineConfig::default(),
        );
        feed.load(2).await.unwrap();

        assert_eq!(top_ids(&feed.items()), vec![id(1), id(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_loads_parents_and_groups() {
        let relays = MockRelays::new();
        relays.add(A, [reply(5, 110, &id(3)), note(3, 50)]);

        let feed = FeedLoader::new(
            loader(&relays),
            FeedOptions::new(vec![A.to_string()], vec![Filter::new().since(100)]),
            &EngineConfig::default(),
        );
        let mut rx = feed.subscribe();
        feed.load(10).await.unwrap();
        assert_eq!(top_ids(&feed.items()), vec![id(5)]);

        // Parent request flushes and resolves inside the orphan window
        rx.wait_for(|items| items.first().is_some_and(|i| i.event.id == id(3)))
            .await
            .unwrap();
        assert_eq!(feed.items()[0].replies[0].id, id(5));
        assert!(relays.queries(A).iter().any(|q| q.filters[0].ids.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_buffers_new_notes() {
        let relays = MockRelays::new();
        let mut opts = FeedOptions::new(vec![A.to_string()], vec![Filter::new().kinds([1])]);
        opts.listen = true;
        opts.load_parents = false;

        let feed = FeedLoader::new(loader(&relays), opts, &EngineConfig::default());
        feed.load(10).await.unwrap();

        relays.push(A, note(7, hearth_core::now() + 60));
        wait(10).await;
        assert_eq!(feed.buffered(), 1);
        assert!(feed.items().is_empty());

        feed.load_buffer();
        assert_eq!(top_ids(&feed.items()), vec![id(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_everything() {
        let relays = MockRelays::new();
        let mut opts = FeedOptions::new(vec![A.to_string()], vec![Filter::new()]);
        opts.listen = true;

        let feed = FeedLoader::new(loader(&relays), opts, &EngineConfig::default());
        feed.load(10).await.unwrap();
        feed.stop();
        wait(10).await;

        assert_eq!(relays.open_queries(A), 0);
        assert!(matches!(feed.load(10).await, Err(Error::Stopped)));
    }
}
