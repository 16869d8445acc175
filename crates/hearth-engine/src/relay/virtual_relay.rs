//! A peer backed by the local store.

use super::{MessageReceiver, PeerMessage, Query, RelayConnection};
use crate::Result;
use crate::repository::{Diff, QueryOptions, Store, Subscription};
use hearth_core::{Event, Filter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Wraps a [`Store`] as a peer.
///
/// Publishing merges into the store; subscribing replays what is stored
/// and then follows the store's batched diffs. Events derived locally
/// (for example unwrapped messages) are published here so they reach
/// subscribers through the same path as remote traffic.
#[derive(Clone)]
pub struct VirtualRelay {
    store: Store,
    queries: Arc<Mutex<HashMap<String, Subscription>>>,
}

impl VirtualRelay {
    /// Create a virtual relay over `store`.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            queries: Arc::default(),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Merge one event into the store.
    pub fn publish(&self, event: Event) -> Diff {
        self.store.merge([event])
    }

    /// Replay stored matches to `on_event`, then deliver future additions
    /// until the returned subscription is dropped.
    pub fn subscribe<F>(&self, filters: Vec<Filter>, on_event: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        for event in self.store.query(&filters, QueryOptions::default()) {
            on_event(&event);
        }
        self.store.subscribe(filters, move |diff| {
            for event in &diff.added {
                on_event(event);
            }
        })
    }
}

impl RelayConnection for VirtualRelay {
    fn open(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    fn send(&self, _url: &str, query: Query) -> Result<MessageReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();

        let live = tx.clone();
        let subscription = self.subscribe(query.filters, move |event| {
            let _ = live.send(PeerMessage::Event(event.clone()));
        });
        let _ = tx.send(PeerMessage::Eose);

        self.queries.lock().insert(query.id, subscription);
        Ok(rx)
    }

    fn close(&self, _url: &str, query_id: &str) {
        self.queries.lock().remove(query_id);
    }
}
