//! Event builders and a scripted relay for unit tests.

use crate::Result;
use crate::relay::{MessageReceiver, MessageSender, PeerMessage, Query, RelayConnection};
use hearth_core::{Event, Filter, KIND_DELETION, KIND_TEXT_NOTE, matches_any};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Author of events built by [`note`] and [`reply`].
pub fn author() -> String {
    pubkey('a')
}

/// A 64-character hex public key made of `c`.
pub fn pubkey(c: char) -> String {
    c.to_string().repeat(64)
}

/// A valid-looking event id for `n`.
pub fn id(n: u64) -> String {
    format!("{n:064x}")
}

/// Build an event with id `id(n)`.
pub fn event(n: u64, kind: u16, pubkey: &str, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
    Event {
        id: id(n),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags: tags
            .into_iter()
            .map(|t| t.into_iter().map(String::from).collect())
            .collect(),
        content: String::new(),
        sig: String::new(),
    }
}

/// A kind-1 note.
pub fn note(n: u64, created_at: u64) -> Event {
    event(n, KIND_TEXT_NOTE, &author(), created_at, vec![])
}

/// A kind-1 note replying to `parent`.
pub fn reply(n: u64, created_at: u64, parent: &str) -> Event {
    event(
        n,
        KIND_TEXT_NOTE,
        &author(),
        created_at,
        vec![vec!["e", parent, "", "reply"]],
    )
}

/// A replaceable event of `kind`.
pub fn replaceable(kind: u16, pubkey: &str, n: u64, created_at: u64) -> Event {
    event(n, kind, pubkey, created_at, vec![])
}

/// A kind-30023 addressable event with identifier `d`.
pub fn addressable(pubkey: &str, d: &str, n: u64, created_at: u64) -> Event {
    event(n, 30_023, pubkey, created_at, vec![vec!["d", d]])
}

/// A kind-5 deletion of ids and addresses.
pub fn deletion(n: u64, created_at: u64, targets: &[&str]) -> Event {
    let tags = targets
        .iter()
        .map(|target| {
            let name = if target.contains(':') { "a" } else { "e" };
            vec![name, *target]
        })
        .collect();
    event(n, KIND_DELETION, &author(), created_at, tags)
}

/// Sleep on the (usually paused) tokio clock.
pub async fn wait(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// An in-memory set of peers answering from canned events.
///
/// Stored events are returned newest first, honoring each filter's fields
/// and `limit`, followed by EOSE. Subscriptions stay open afterwards and
/// receive events added through [`push`](Self::push).
#[derive(Clone, Default)]
pub struct MockRelays {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    events: HashMap<String, Vec<Event>>,
    queries: HashMap<String, Vec<Query>>,
    silent: HashSet<String>,
    opened: Vec<String>,
    live: Vec<OpenQuery>,
}

struct OpenQuery {
    peer: String,
    query: Query,
    tx: MessageSender,
}

impl MockRelays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store events on `peer`.
    pub fn add<I: IntoIterator<Item = Event>>(&self, peer: &str, events: I) {
        self.inner
            .lock()
            .events
            .entry(peer.to_string())
            .or_default()
            .extend(events);
    }

    /// Make `peer` accept queries but never answer them.
    pub fn silence(&self, peer: &str) {
        self.inner.lock().silent.insert(peer.to_string());
    }

    /// Store an event on `peer` and deliver it to matching open queries.
    pub fn push(&self, peer: &str, event: Event) {
        let mut inner = self.inner.lock();
        for live in inner.live.iter().filter(|l| l.peer == peer) {
            if matches_any(&live.query.filters, &event) {
                let _ = live.tx.send(PeerMessage::Event(event.clone()));
            }
        }
        inner
            .events
            .entry(peer.to_string())
            .or_default()
            .push(event);
    }

    /// Close every open query on `peer` with a reason.
    pub fn kick(&self, peer: &str, reason: &str) {
        let mut inner = self.inner.lock();
        inner.live.retain(|live| {
            if live.peer == peer {
                let _ = live.tx.send(PeerMessage::Closed(Some(reason.to_string())));
                false
            } else {
                true
            }
        });
    }

    /// Queries `peer` received, in order.
    pub fn queries(&self, peer: &str) -> Vec<Query> {
        self.inner
            .lock()
            .queries
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of queries still open on `peer`.
    pub fn open_queries(&self, peer: &str) -> usize {
        self.inner
            .lock()
            .live
            .iter()
            .filter(|l| l.peer == peer)
            .count()
    }

    /// Peers opened ahead of queries.
    pub fn opened(&self) -> Vec<String> {
        self.inner.lock().opened.clone()
    }

    fn answer(events: &[Event], filters: &[Filter]) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for filter in filters {
            let mut matches: Vec<&Event> = events.iter().filter(|e| filter.matches(e)).collect();
            matches.sort_by(|a, b| b.version_cmp(a));
            if let Some(limit) = filter.limit {
                matches.truncate(limit);
            }
            for event in matches {
                if seen.insert(event.id.clone()) {
                    results.push(event.clone());
                }
            }
        }
        results.sort_by(|a, b| b.version_cmp(a));
        results
    }
}

impl RelayConnection for MockRelays {
    fn open(&self, url: &str) -> Result<()> {
        self.inner.lock().opened.push(url.to_string());
        Ok(())
    }

    fn send(&self, url: &str, query: Query) -> Result<MessageReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        inner
            .queries
            .entry(url.to_string())
            .or_default()
            .push(query.clone());

        if !inner.silent.contains(url) {
            let stored = inner.events.get(url).map(Vec::as_slice).unwrap_or_default();
            for event in Self::answer(stored, &query.filters) {
                let _ = tx.send(PeerMessage::Event(event));
            }
            let _ = tx.send(PeerMessage::Eose);
        }

        inner.live.push(OpenQuery {
            peer: url.to_string(),
            query,
            tx,
        });
        Ok(rx)
    }

    fn close(&self, url: &str, query_id: &str) {
        self.inner
            .lock()
            .live
            .retain(|live| !(live.peer == url && live.query.id == query_id));
    }
}
