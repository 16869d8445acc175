//! Debounced change notification over a [`Repository`].

use super::{Diff, MergeOutcome, QueryOptions, Repository};
use crate::schedule::Batcher;
use hearth_core::{Event, Filter, matches_any};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

type Listener = Arc<dyn Fn(&Diff) + Send + Sync>;

/// A shared repository whose diffs are delivered in debounced batches.
///
/// Mutations apply immediately and return their own diff. Listeners see
/// one composed diff per debounce window instead, so they never observe a
/// state between mutations of the same batch.
///
/// Cloning is cheap; clones share the same repository.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    repository: Mutex<Repository>,
    pending: Mutex<Batcher<Diff>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

impl Store {
    /// Create an empty store delivering diffs `debounce` after the first
    /// mutation of each batch.
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                repository: Mutex::new(Repository::new()),
                pending: Mutex::new(Batcher::new(debounce)),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Merge events. See [`Repository::merge`].
    pub fn merge<I>(&self, events: I) -> Diff
    where
        I: IntoIterator<Item = Event>,
    {
        let diff = self.inner.repository.lock().merge(events);
        self.schedule(diff.clone());
        diff
    }

    /// Merge one event. See [`Repository::merge_one`].
    pub fn merge_one(&self, event: Event) -> MergeOutcome {
        let (outcome, diff) = self.inner.repository.lock().merge_one(event);
        self.schedule(diff);
        outcome
    }

    /// Install tombstones. See [`Repository::delete`].
    pub fn delete<I, S>(&self, keys: I, at: u64) -> Diff
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let diff = self.inner.repository.lock().delete(keys, at);
        self.schedule(diff.clone());
        diff
    }

    /// Warm-start from dumped events.
    pub fn load(&self, events: Vec<Event>) -> Diff {
        let diff = self.inner.repository.lock().load(events);
        self.schedule(diff.clone());
        diff
    }

    /// Every live record.
    pub fn dump(&self) -> Vec<Event> {
        self.inner.repository.lock().dump()
    }

    /// Matching records, newest first.
    pub fn query(&self, filters: &[Filter], opts: QueryOptions) -> Vec<Event> {
        self.inner.repository.lock().query(filters, opts)
    }

    /// A record by id or address.
    pub fn get(&self, id_or_address: &str, opts: QueryOptions) -> Option<Event> {
        self.inner
            .repository
            .lock()
            .get(id_or_address, opts)
            .cloned()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.inner.repository.lock().len()
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with the repository locked.
    ///
    /// `f` must not call back into the store.
    pub fn with_repository<R>(&self, f: impl FnOnce(&Repository) -> R) -> R {
        f(&self.inner.repository.lock())
    }

    fn schedule(&self, diff: Diff) {
        if diff.is_empty() {
            return;
        }

        let armed = self.inner.pending.lock().push(diff, Instant::now());
        let Some(deadline) = armed else { return };

        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::downgrade(&self.inner);
                handle.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(inner) = inner.upgrade() {
                        Store { inner }.flush();
                    }
                });
            }
            // Outside a runtime there is nothing to debounce against.
            Err(_) => self.flush(),
        }
    }

    /// Deliver everything pending now, as one composed diff.
    pub fn flush(&self) {
        let batches = self.inner.pending.lock().take();
        let mut diff = Diff::default();
        for batch in batches {
            diff.absorb(batch);
        }
        if diff.is_empty() {
            return;
        }

        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        metrics::counter!("store_diffs_flushed_total").increment(1);
        tracing::trace!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            listeners = listeners.len(),
            "flushing diff"
        );

        for listener in listeners {
            listener(&diff);
        }
    }

    /// Receive every batched diff until the subscription is dropped.
    pub fn on_update<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Diff) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(f)));
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Receive batched diffs restricted to `filters`.
    ///
    /// `added` holds only matching events not already present when the
    /// subscription was created. `removed` holds only keys of records this
    /// subscription could have seen.
    pub fn subscribe<F>(&self, filters: Vec<Filter>, on_diff: F) -> Subscription
    where
        F: Fn(&Diff) + Send + Sync + 'static,
    {
        let known: HashSet<String> = self
            .query(&filters, QueryOptions::default())
            .iter()
            .flat_map(Event::id_and_address)
            .collect();
        let known = Mutex::new(known);

        self.on_update(move |diff| {
            let mut known = known.lock();
            let mut scoped = Diff::default();

            for key in &diff.removed {
                if known.remove(key) {
                    scoped.removed.insert(key.clone());
                }
            }
            for event in diff.added.iter().filter(|e| matches_any(&filters, e)) {
                // Already seen through the initial snapshot.
                if known.contains(&event.id) {
                    continue;
                }
                known.extend(event.id_and_address());
                scoped.added.push(event.clone());
            }
            drop(known);

            if !scoped.is_empty() {
                on_diff(&scoped);
            }
        })
    }

    /// A live, sorted view of the records matching `filters`.
    pub fn derive(&self, filters: Vec<Filter>, opts: QueryOptions) -> LiveQuery {
        let (tx, rx) = watch::channel(self.query(&filters, opts));

        let subscription = self.on_update(move |diff| {
            tx.send_if_modified(|events| apply_diff(events, diff, &filters, opts));
        });

        LiveQuery {
            rx,
            _subscription: subscription,
        }
    }

    /// A live view of one record by id or address.
    pub fn derive_event(&self, id_or_address: &str, opts: QueryOptions) -> LiveQuery {
        self.derive(Filter::for_ids_or_addresses([id_or_address]), opts)
    }
}

fn apply_diff(events: &mut Vec<Event>, diff: &Diff, filters: &[Filter], opts: QueryOptions) -> bool {
    let before = events.len();
    let mut modified = false;

    if !opts.include_deleted {
        events.retain(|event| !diff.removes(event));
        modified = events.len() != before;
    }

    for event in diff.added.iter().filter(|e| matches_any(filters, e)) {
        if events.iter().any(|held| held.id == event.id) {
            continue;
        }
        // A newer version supersedes the held one even when deleted
        // records are kept.
        if let Some(address) = event.address() {
            events.retain(|held| held.address().as_ref() != Some(&address));
        }
        events.push(event.clone());
        modified = true;
    }

    if modified {
        events.sort_by(|a, b| b.version_cmp(a));
    }
    modified
}

/// Handle to a store listener; unregisters on drop.
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl Subscription {
    /// Stop receiving diffs.
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// A reactive query result, kept current by the store's batched diffs.
pub struct LiveQuery {
    rx: watch::Receiver<Vec<Event>>,
    _subscription: Subscription,
}

impl LiveQuery {
    /// The current result set, newest first.
    pub fn get(&self) -> Vec<Event> {
        self.rx.borrow().clone()
    }

    /// The first result, for single-record views.
    pub fn first(&self) -> Option<Event> {
        self.rx.borrow().first().cloned()
    }

    /// Wait until the result set changes.
    pub async fn changed(&mut self) -> crate::Result<()> {
        self.rx.changed().await.map_err(|_| crate::Error::Stopped)
    }

    /// A receiver for consumers that drive their own watch loop.
    pub fn receiver(&self) -> watch::Receiver<Vec<Event>> {
        self.rx.clone()
    }
}
