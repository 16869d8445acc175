//! The engine facade.
//!
//! [`Engine`] owns one of each component and wires them the way data flows:
//!
//! ```text
//! peers ──▶ Loader ──▶ Ingestor ──▶ Store ──▶ diffs ──▶ subscribers, feeds
//!                         │
//!                         └──▶ Projections ──▶ rumors ──▶ VirtualRelay
//! ```
//!
//! The [`Ingestor`] is the single path into the store for delivered events:
//! shape check, verification, tracker registration, merge, then dispatch.

use crate::config::EngineConfig;
use crate::error::Rejection;
use crate::projections::{Decryptor, KeyLookup, Projections, Unwrapper};
use crate::relay::{LOCAL_RELAY_URL, PeerRouter, RelayConnection, VirtualRelay};
use crate::repository::{Diff, LiveQuery, QueryOptions, Store, Subscription};
use crate::request::{FeedLoader, FeedOptions, Ingest, LoadHandle, LoadRequest, Loader};
use crate::tracker::{EventTracker, SharedTracker};
use crate::Result;
use hearth_core::{Event, Filter, Verifier};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;

/// Accepts delivered events into the store and projections.
///
/// An id is only trusted once a copy carrying it has verified. Later copies
/// skip verification only when they are identical to the held record, so a
/// peer reusing a known id with other content can neither shadow nor
/// censor the genuine event.
pub struct Ingestor {
    tracker: SharedTracker,
    local: VirtualRelay,
    projections: Arc<Mutex<Projections>>,
    verifier: Arc<dyn Verifier>,
}

impl Ingestor {
    pub fn new(
        tracker: SharedTracker,
        local: VirtualRelay,
        projections: Arc<Mutex<Projections>>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            tracker,
            local,
            projections,
            verifier,
        }
    }

    /// Process one delivery of `event` by `peer`.
    ///
    /// Returns `Ok(true)` for the first verified delivery of an id and
    /// `Ok(false)` for a verified copy of an accepted one. Events from
    /// [`LOCAL_RELAY_URL`] are trusted and skip verification.
    pub fn accept(&self, event: &Event, peer: &str) -> std::result::Result<bool, Rejection> {
        metrics::counter!("engine_events_received_total").increment(1);

        let known = self.tracker.lock().contains(&event.id);
        if known && self.holds_exact(event) {
            self.tracker.lock().add(event, peer);
            metrics::counter!("engine_events_duplicate_total").increment(1);
            return Ok(false);
        }

        if let Err(e) = event.check_shape() {
            tracing::debug!(peer = %peer, error = %e, "Dropping malformed event");
            return Err(reject(Rejection::Malformed));
        }
        if peer != LOCAL_RELAY_URL && !self.verifier.verify(event) {
            tracing::debug!(peer = %peer, id = %event.id, "Dropping unverified event");
            return Err(reject(Rejection::Unverified));
        }

        // A verified copy of a known id that is no longer held, or that
        // carries another valid signature.
        if self.tracker.lock().add(event, peer) {
            metrics::counter!("engine_events_duplicate_total").increment(1);
            return Ok(false);
        }
        metrics::counter!("engine_events_accepted_total").increment(1);

        self.local.store().merge_one(event.clone());

        let dispatch = self.projections.lock().push(event.clone(), Instant::now());
        for rumor in dispatch.rumors {
            self.local.publish(rumor);
        }
        if let Some(deadline) = dispatch.flush_at {
            self.schedule_global(deadline);
        }

        Ok(true)
    }

    /// Whether the store holds a record identical to `event`.
    fn holds_exact(&self, event: &Event) -> bool {
        let opts = QueryOptions {
            include_deleted: true,
        };
        self.local
            .store()
            .with_repository(|repo| repo.get(&event.id, opts).is_some_and(|held| held == event))
    }

    fn schedule_global(&self, deadline: Instant) {
        match Handle::try_current() {
            Ok(handle) => {
                let projections = Arc::downgrade(&self.projections);
                handle.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(projections) = projections.upgrade() {
                        projections.lock().flush_due(Instant::now());
                    }
                });
            }
            Err(_) => {
                self.projections.lock().flush();
            }
        }
    }
}

fn reject(reason: Rejection) -> Rejection {
    metrics::counter!("engine_events_invalid_total", "reason" => reason.as_str()).increment(1);
    reason
}

impl Ingest for Ingestor {
    fn ingest(&self, event: &Event, peer: &str) -> bool {
        self.accept(event, peer).is_ok()
    }
}

struct EngineInner {
    config: EngineConfig,
    tracker: SharedTracker,
    store: Store,
    local: VirtualRelay,
    projections: Arc<Mutex<Projections>>,
    ingestor: Arc<Ingestor>,
    loader: Loader,
}

/// One sync engine: store, tracker, projections and loader.
///
/// Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine loading remote peers through `remote`.
    ///
    /// [`LOCAL_RELAY_URL`] is always served by the engine's own
    /// [`VirtualRelay`].
    pub fn new(
        remote: Arc<dyn RelayConnection>,
        verifier: Arc<dyn Verifier>,
        config: EngineConfig,
    ) -> Self {
        let tracker = EventTracker::shared();
        let store = Store::new(config.diff_debounce);
        let local = VirtualRelay::new(store.clone());
        let projections = Arc::new(Mutex::new(Projections::new(&config)));
        let ingestor = Arc::new(Ingestor::new(
            tracker.clone(),
            local.clone(),
            projections.clone(),
            verifier,
        ));
        let router = Arc::new(PeerRouter::new(local.clone(), remote));
        let loader = Loader::new(router, ingestor.clone(), &config);

        Self {
            inner: Arc::new(EngineInner {
                config,
                tracker,
                store,
                local,
                projections,
                ingestor,
                loader,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.inner.tracker
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// The local peer.
    pub fn local(&self) -> &VirtualRelay {
        &self.inner.local
    }

    pub fn loader(&self) -> &Loader {
        &self.inner.loader
    }

    /// Register handlers through `f`.
    ///
    /// Handlers run while the registry is locked and must not call back
    /// into the engine's ingestion path.
    pub fn with_projections<R>(&self, f: impl FnOnce(&mut Projections) -> R) -> R {
        f(&mut self.inner.projections.lock())
    }

    /// Open gift wraps with `decryptor`, trying the keys `keys` returns.
    pub fn unwrap_with(&self, decryptor: Arc<dyn Decryptor>, keys: Arc<dyn KeyLookup>) {
        let unwrapper = Unwrapper::new(decryptor, keys, self.inner.tracker.clone());
        self.inner.projections.lock().set_unwrapper(unwrapper);
    }

    /// Hand a delivered event to the ingestion path directly.
    pub fn ingest(&self, event: &Event, peer: &str) -> std::result::Result<bool, Rejection> {
        self.inner.ingestor.accept(event, peer)
    }

    /// Publish a locally created event through the local peer.
    pub fn publish(&self, event: &Event) -> std::result::Result<bool, Rejection> {
        self.inner.ingestor.accept(event, LOCAL_RELAY_URL)
    }

    /// Install tombstones for ids or addresses at `at`.
    pub fn delete<I, S>(&self, keys: I, at: u64) -> Diff
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.store.delete(keys, at)
    }

    /// Matching stored events, newest first.
    pub fn query(&self, filters: &[Filter], opts: QueryOptions) -> Vec<Event> {
        self.inner.store.query(filters, opts)
    }

    /// Follow batched diffs restricted to `filters`.
    pub fn subscribe<F>(&self, filters: Vec<Filter>, on_diff: F) -> Subscription
    where
        F: Fn(&Diff) + Send + Sync + 'static,
    {
        self.inner.store.subscribe(filters, on_diff)
    }

    /// A live view of `query(filters)`.
    pub fn derive(&self, filters: Vec<Filter>, opts: QueryOptions) -> LiveQuery {
        self.inner.store.derive(filters, opts)
    }

    /// Queue a coalesced load.
    pub fn load(&self, request: LoadRequest) -> LoadHandle {
        self.inner.loader.load(request)
    }

    /// Queue a coalesced load and wait for its events.
    pub async fn fetch(&self, request: LoadRequest) -> Result<Vec<Event>> {
        self.inner.loader.fetch(request).await
    }

    /// Start a feed.
    pub fn feed(&self, opts: FeedOptions) -> FeedLoader {
        FeedLoader::new(self.inner.loader.clone(), opts, &self.inner.config)
    }
}
