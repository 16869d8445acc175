//! Request coalescing.
//!
//! Callers describe what they want as a [`LoadRequest`]. Requests queue up
//! for a short flush window; each flush then sends exactly one query per
//! peer, carrying the combined filters of every queued request naming that
//! peer, and fans results back out:
//!
//! - every requester whose filters match an event receives it once, even
//!   when several peers deliver it
//! - EOSE from a peer is reported to every requester that named the peer
//! - a requester completes when all its peers reached EOSE, closed, or ran
//!   past its timeout; its handle then resolves with what it collected
//!
//! Within a flush, an exact (event id, peer) re-delivery is dropped before
//! ingestion.

use super::Ingest;
use crate::config::EngineConfig;
use crate::relay::{PeerMessage, Query, RelayConnection, normalize_peer_url};
use crate::schedule::Batcher;
use crate::tracker::EventTracker;
use crate::{Error, Result};
use hearth_core::{Event, Filter, combine_filters, matches_any};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;

type OnEvent = Arc<dyn Fn(&Event, &str) + Send + Sync>;
type OnEose = Arc<dyn Fn(&str) + Send + Sync>;
type OnClose = Arc<dyn Fn(&[Event]) + Send + Sync>;

/// One logical request.
pub struct LoadRequest {
    peers: Vec<String>,
    filters: Vec<Filter>,
    on_event: Option<OnEvent>,
    on_eose: Option<OnEose>,
    on_close: Option<OnClose>,
    timeout: Option<Duration>,
    close_on_eose: bool,
}

impl LoadRequest {
    /// Request `filters` from each of `peers`.
    pub fn new<I, S>(peers: I, filters: Vec<Filter>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            peers: peers.into_iter().map(|p| p.as_ref().to_string()).collect(),
            filters,
            on_event: None,
            on_eose: None,
            on_close: None,
            timeout: None,
            close_on_eose: true,
        }
    }

    /// Called once per matching event, with the peer that delivered it first.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event, &str) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    /// Called when a peer reports it has no more stored events.
    pub fn on_eose<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_eose = Some(Arc::new(f));
        self
    }

    /// Called once with everything collected, when the request completes.
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Event]) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Give up on peers that have not finished after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep the request open after EOSE to receive new events, until the
    /// handle is closed or every peer closes.
    pub fn live(mut self) -> Self {
        self.close_on_eose = false;
        self
    }
}

/// Per-requester progress, guarded by the item's lock.
#[derive(Default)]
struct Progress {
    /// Peers that have not yet reached EOSE.
    pending: HashSet<String>,
    /// Peers whose subscription is still open.
    open: HashSet<String>,
    /// Ids already delivered to this requester.
    seen: HashSet<String>,
    events: Vec<Event>,
    done: bool,
}

struct Item {
    peers: Vec<String>,
    filters: Vec<Filter>,
    on_event: Option<OnEvent>,
    on_eose: Option<OnEose>,
    on_close: Option<OnClose>,
    timeout: Duration,
    close_on_eose: bool,
    progress: Mutex<Progress>,
    closed: AtomicBool,
    result: Mutex<Option<oneshot::Sender<Vec<Event>>>>,
}

impl Item {
    fn is_done(&self) -> bool {
        self.progress.lock().done
    }

    fn names(&self, peer: &str) -> bool {
        self.peers.iter().any(|p| p == peer)
    }

    fn wants(&self, event: &Event) -> bool {
        !self.closed.load(Ordering::Acquire) && matches_any(&self.filters, event)
    }

    fn deliver(&self, event: &Event, peer: &str) {
        {
            let mut progress = self.progress.lock();
            if progress.done || !progress.seen.insert(event.id.clone()) {
                return;
            }
            progress.events.push(event.clone());
        }
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(on_event) = &self.on_event {
            on_event(event, peer);
        }
    }

    /// Record that `peer` reached EOSE (or gave up on it).
    fn eose(&self, peer: &str, notify: bool) {
        let (removed, complete) = {
            let mut progress = self.progress.lock();
            if progress.done {
                return;
            }
            let removed = progress.pending.remove(peer);
            (removed, self.close_on_eose && progress.pending.is_empty())
        };
        if removed
            && notify
            && let Some(on_eose) = &self.on_eose
        {
            on_eose(peer);
        }
        if complete {
            self.finish();
        }
    }

    /// Record that `peer` closed the subscription.
    fn closed_by(&self, peer: &str) {
        let complete = {
            let mut progress = self.progress.lock();
            if progress.done {
                return;
            }
            progress.pending.remove(peer);
            progress.open.remove(peer);
            progress.open.is_empty() || (self.close_on_eose && progress.pending.is_empty())
        };
        if complete {
            self.finish();
        }
    }

    /// Peers still owed an EOSE.
    fn pending(&self) -> Vec<String> {
        let progress = self.progress.lock();
        if progress.done {
            return Vec::new();
        }
        progress.pending.iter().cloned().collect()
    }

    fn finish(&self) {
        let events = {
            let mut progress = self.progress.lock();
            if progress.done {
                return;
            }
            progress.done = true;
            std::mem::take(&mut progress.events)
        };

        if !self.closed.load(Ordering::Acquire)
            && let Some(on_close) = &self.on_close
        {
            on_close(&events);
        }
        if let Some(tx) = self.result.lock().take() {
            let _ = tx.send(events);
        }
    }
}

/// Handle to one queued request.
pub struct LoadHandle {
    item: Arc<Item>,
    rx: oneshot::Receiver<Vec<Event>>,
    loader: Arc<LoaderInner>,
}

impl LoadHandle {
    /// Wait for completion and return every event delivered to this request.
    pub async fn events(self) -> Result<Vec<Event>> {
        self.rx.await.map_err(|_| Error::Stopped)
    }

    /// Stop delivery to this request now.
    ///
    /// No callback runs after this returns. A pending [`events`](Self::events)
    /// call resolves with what was collected so far.
    pub fn close(&self) {
        self.item.closed.store(true, Ordering::Release);
        self.item.finish();
        self.loader.closed.notify_waiters();
    }

    /// Whether the request has completed or been closed.
    pub fn is_done(&self) -> bool {
        self.item.is_done()
    }
}

struct LoaderInner {
    conn: Arc<dyn RelayConnection>,
    ingest: Arc<dyn Ingest>,
    queue: Mutex<Batcher<Arc<Item>>>,
    default_timeout: Duration,
    closed: Notify,
}

/// Coalesces concurrent requests into one query per peer per flush.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl Loader {
    /// Create a loader sending through `conn` and handing events to `ingest`.
    pub fn new(
        conn: Arc<dyn RelayConnection>,
        ingest: Arc<dyn Ingest>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                conn,
                ingest,
                queue: Mutex::new(Batcher::new(config.request_flush_delay)),
                default_timeout: config.request_timeout,
                closed: Notify::new(),
            }),
        }
    }

    /// Queue a request.
    ///
    /// Must be called within a Tokio runtime. Invalid peer URLs are skipped;
    /// a request left with no peers or no filters completes immediately.
    pub fn load(&self, request: LoadRequest) -> LoadHandle {
        let mut peers: Vec<String> = Vec::new();
        for peer in &request.peers {
            match normalize_peer_url(peer) {
                Ok(url) if !peers.contains(&url) => peers.push(url),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping peer: {}", e),
            }
        }

        let (tx, rx) = oneshot::channel();
        let empty = peers.is_empty() || request.filters.is_empty();
        let item = Arc::new(Item {
            progress: Mutex::new(Progress {
                pending: peers.iter().cloned().collect(),
                open: peers.iter().cloned().collect(),
                ..Default::default()
            }),
            peers,
            filters: request.filters,
            on_event: request.on_event,
            on_eose: request.on_eose,
            on_close: request.on_close,
            timeout: request.timeout.unwrap_or(self.inner.default_timeout),
            close_on_eose: request.close_on_eose,
            closed: AtomicBool::new(false),
            result: Mutex::new(Some(tx)),
        });

        let handle = LoadHandle {
            item: item.clone(),
            rx,
            loader: self.inner.clone(),
        };

        if empty {
            item.finish();
            return handle;
        }

        metrics::counter!("coalescer_requests_total").increment(1);
        let armed = self.inner.queue.lock().push(item, Instant::now());
        if let Some(deadline) = armed {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let items = inner.queue.lock().take();
                execute(inner, items).await;
            });
        }

        handle
    }

    /// Queue a request and wait for its events.
    pub async fn fetch(&self, request: LoadRequest) -> Result<Vec<Event>> {
        self.load(request).events().await
    }

    /// Start connecting to peers ahead of their first request.
    pub fn open(&self, peers: &[String]) {
        for peer in peers {
            match normalize_peer_url(peer) {
                Ok(url) => {
                    if let Err(e) = self.inner.conn.open(&url) {
                        tracing::warn!(peer = %url, "Failed to open: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Skipping peer: {}", e),
            }
        }
    }
}

/// An open per-peer query within one flush.
struct PeerQuery {
    id: String,
    sent_at: Instant,
    items: Vec<usize>,
}

/// Run one flush: send, fan out, and close queries as requesters finish.
async fn execute(inner: Arc<LoaderInner>, items: Vec<Arc<Item>>) {
    let items: Vec<Arc<Item>> = items.into_iter().filter(|i| !i.is_done()).collect();
    if items.is_empty() {
        return;
    }
    metrics::counter!("coalescer_flushes_total").increment(1);

    let started = Instant::now();
    let deadlines: Vec<Instant> = items.iter().map(|i| started + i.timeout).collect();

    let mut by_peer: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        for peer in &item.peers {
            by_peer.entry(peer.clone()).or_default().push(index);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Option<PeerMessage>)>();
    let mut open: HashMap<String, PeerQuery> = HashMap::new();

    for (peer, indexes) in by_peer {
        let filters: Vec<Filter> = indexes
            .iter()
            .flat_map(|&i| items[i].filters.iter().cloned())
            .collect();
        let query = Query::new(combine_filters(&filters));
        let query_id = query.id.clone();

        match inner.conn.send(&peer, query) {
            Ok(mut peer_rx) => {
                metrics::counter!("coalescer_queries_total").increment(1);
                tracing::debug!(
                    peer = %peer,
                    query = %query_id,
                    requests = indexes.len(),
                    "Sent query"
                );

                let tx = tx.clone();
                let forward_peer = peer.clone();
                tokio::spawn(async move {
                    while let Some(message) = peer_rx.recv().await {
                        if tx.send((forward_peer.clone(), Some(message))).is_err() {
                            return;
                        }
                    }
                    let _ = tx.send((forward_peer, None));
                });

                open.insert(
                    peer,
                    PeerQuery {
                        id: query_id,
                        sent_at: Instant::now(),
                        items: indexes,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(peer = %peer, "Failed to send query: {}", e);
                for &i in &indexes {
                    items[i].closed_by(&peer);
                }
            }
        }
    }
    drop(tx);

    let mut tracker = EventTracker::new();

    // Registered before every check of the items, so a close landing while
    // this task is busy elsewhere still wakes the loop.
    let closed = inner.closed.notified();
    tokio::pin!(closed);
    closed.as_mut().enable();

    loop {
        release_finished(&inner, &items, &mut open);
        if open.is_empty() || items.iter().all(|i| i.is_done()) {
            break;
        }

        let next_deadline = items
            .iter()
            .zip(&deadlines)
            .filter(|(item, _)| !item.pending().is_empty())
            .map(|(_, deadline)| *deadline)
            .min();

        tokio::select! {
            message = rx.recv() => match message {
                Some((peer, Some(PeerMessage::Event(event)))) => {
                    fan_out(&inner, &items, &open, &mut tracker, &peer, event);
                }
                Some((peer, Some(PeerMessage::Eose))) => {
                    if let Some(query) = open.get(&peer) {
                        for &i in &query.items {
                            items[i].eose(&peer, true);
                        }
                    }
                }
                Some((peer, Some(PeerMessage::Closed(reason)))) => {
                    tracing::debug!(peer = %peer, reason = ?reason, "Peer closed query");
                    peer_gone(&items, &mut open, &peer);
                }
                Some((peer, None)) => peer_gone(&items, &mut open, &peer),
                None => break,
            },
            _ = sleep_until(next_deadline) => {
                let now = Instant::now();
                for (item, deadline) in items.iter().zip(&deadlines) {
                    if *deadline > now {
                        continue;
                    }
                    for peer in item.pending() {
                        tracing::warn!(peer = %peer, "Request timed out");
                        metrics::counter!("coalescer_peer_timeouts_total").increment(1);
                        item.eose(&peer, false);
                    }
                }
            }
            _ = closed.as_mut() => {
                closed.set(inner.closed.notified());
                closed.as_mut().enable();
            }
        }
    }

    for item in &items {
        item.finish();
    }
    for (peer, query) in open.drain() {
        inner.conn.close(&peer, &query.id);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn fan_out(
    inner: &LoaderInner,
    items: &[Arc<Item>],
    open: &HashMap<String, PeerQuery>,
    tracker: &mut EventTracker,
    peer: &str,
    event: Event,
) {
    let Some(query) = open.get(peer) else { return };
    if tracker.has(&event.id, peer) {
        return;
    }

    let targets: Vec<&Arc<Item>> = query
        .items
        .iter()
        .map(|&i| &items[i])
        .filter(|item| item.wants(&event))
        .collect();
    if targets.is_empty() {
        tracker.add(&event, peer);
        return;
    }
    // Rejected copies leave the pair open for a valid copy of the same id.
    if !inner.ingest.ingest(&event, peer) {
        return;
    }
    tracker.add(&event, peer);

    for item in targets {
        item.deliver(&event, peer);
    }
}

fn peer_gone(items: &[Arc<Item>], open: &mut HashMap<String, PeerQuery>, peer: &str) {
    if let Some(query) = open.remove(peer) {
        for &i in &query.items {
            items[i].closed_by(peer);
        }
    }
}

/// Close peer queries no unfinished requester depends on.
fn release_finished(inner: &LoaderInner, items: &[Arc<Item>], open: &mut HashMap<String, PeerQuery>) {
    open.retain(|peer, query| {
        let needed = query.items.iter().any(|&i| !items[i].is_done());
        if !needed {
            metrics::histogram!("coalescer_query_duration_seconds")
                .record(query.sent_at.elapsed().as_secs_f64());
            inner.conn.close(peer, &query.id);
        }
        needed
    });
}
