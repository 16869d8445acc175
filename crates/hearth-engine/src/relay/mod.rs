//! Peers and the connection seam.
//!
//! Everything that can answer a query implements [`RelayConnection`]:
//!
//! - [`NostrPool`] speaks to remote relays through `nostr-sdk`
//! - [`VirtualRelay`] answers from the local store, so locally derived events
//!   travel the same path as network traffic
//! - [`PeerRouter`] sends [`LOCAL_RELAY_URL`] to the virtual relay and every
//!   other URL to a remote connection
//!
//! Connection management (handshake, reconnect, backoff) belongs to the
//! implementation; callers only see a stream of [`PeerMessage`]s per query.

mod pool;
mod url;
mod virtual_relay;

pub use pool::NostrPool;
pub use url::normalize_peer_url;
pub use virtual_relay::VirtualRelay;

use crate::Result;
use hearth_core::{Event, Filter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Reserved URL of the in-process virtual relay.
pub const LOCAL_RELAY_URL: &str = "local://";

/// One subscription request sent to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Subscription id, unique per process.
    pub id: String,
    /// Disjunction of filters.
    pub filters: Vec<Filter>,
}

impl Query {
    /// A query with a fresh id.
    pub fn new(filters: Vec<Filter>) -> Self {
        Self {
            id: next_query_id(),
            filters,
        }
    }
}

/// What a peer reports for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// A matching event.
    Event(Event),
    /// No more stored events; live events may follow.
    Eose,
    /// The peer closed the subscription, with its reason if given.
    Closed(Option<String>),
}

/// Sending half of a query's message stream.
pub type MessageSender = mpsc::UnboundedSender<PeerMessage>;

/// Receiving half of a query's message stream.
pub type MessageReceiver = mpsc::UnboundedReceiver<PeerMessage>;

/// A source of events addressed by peer URL.
///
/// Implementations must be cheap to call from synchronous code: network
/// work happens on tasks they spawn, and results arrive on the returned
/// channel. Dropping the receiver is equivalent to closing the query.
pub trait RelayConnection: Send + Sync {
    /// Start connecting to `url` ahead of the first query.
    fn open(&self, url: &str) -> Result<()>;

    /// Subscribe `url` to `query`.
    fn send(&self, url: &str, query: Query) -> Result<MessageReceiver>;

    /// Close a subscription previously opened with [`send`](Self::send).
    fn close(&self, url: &str, query_id: &str);
}

/// Generate a process-unique subscription id.
pub fn next_query_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("hearth-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Routes the local peer URL to a [`VirtualRelay`] and the rest elsewhere.
#[derive(Clone)]
pub struct PeerRouter {
    local: VirtualRelay,
    remote: Arc<dyn RelayConnection>,
}

impl PeerRouter {
    /// Create a router over a local and a remote connection.
    pub fn new(local: VirtualRelay, remote: Arc<dyn RelayConnection>) -> Self {
        Self { local, remote }
    }

    fn route(&self, url: &str) -> &dyn RelayConnection {
        if url == LOCAL_RELAY_URL {
            &self.local
        } else {
            self.remote.as_ref()
        }
    }
}

impl RelayConnection for PeerRouter {
    fn open(&self, url: &str) -> Result<()> {
        self.route(url).open(url)
    }

    fn send(&self, url: &str, query: Query) -> Result<MessageReceiver> {
        self.route(url).send(url, query)
    }

    fn close(&self, url: &str, query_id: &str) {
        self.route(url).close(url, query_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Store;
    use crate::testing::{MockRelays, note};
    use std::time::Duration;

    #[test]
    fn test_query_ids_are_unique() {
        assert_ne!(next_query_id(), next_query_id());
    }

    #[tokio::test]
    async fn test_router_splits_local_and_remote() {
        let store = Store::new(Duration::from_millis(300));
        store.merge([note(1, 10)]);

        let remote = MockRelays::new();
        remote.add("wss://a", [note(2, 20)]);

        let router = PeerRouter::new(VirtualRelay::new(store), Arc::new(remote.clone()));

        let mut local = router
            .send(LOCAL_RELAY_URL, Query::new(vec![Filter::new()]))
            .unwrap();
        assert!(matches!(local.recv().await, Some(PeerMessage::Event(e)) if e.created_at == 10));
        assert_eq!(local.recv().await, Some(PeerMessage::Eose));

        let mut wss = router
            .send("wss://a", Query::new(vec![Filter::new()]))
            .unwrap();
        assert!(matches!(wss.recv().await, Some(PeerMessage::Event(e)) if e.created_at == 20));
        assert_eq!(remote.queries("wss://a").len(), 1);
        assert!(remote.queries(LOCAL_RELAY_URL).is_empty());
    }
}
