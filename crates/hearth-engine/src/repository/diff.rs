//! Mutation deltas.

use hearth_core::Event;
use std::collections::HashSet;

/// The delta produced by one or more repository mutations.
///
/// `removed` holds ids and, for deletions by address, address strings.
/// Composition keeps the invariant that a removed key never also appears
/// among `added`, so applying a diff is order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Events that became live.
    pub added: Vec<Event>,
    /// Ids or addresses that stopped being live.
    pub removed: HashSet<String>,
}

impl Diff {
    /// Whether the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Record that `event` became live.
    ///
    /// An earlier removal of its address is cancelled; removals of the ids
    /// of older versions stand.
    pub fn add(&mut self, event: Event) {
        self.removed.remove(&event.id);
        if let Some(address) = event.address() {
            self.removed.remove(&address.to_string());
        }
        self.added.push(event);
    }

    /// Record that `key` (an id or address) stopped being live.
    pub fn remove(&mut self, key: String) {
        self.added.retain(|event| !Self::covers(event, &key));
        self.removed.insert(key);
    }

    /// Fold a later diff into this one.
    pub fn absorb(&mut self, later: Diff) {
        for key in later.removed {
            self.remove(key);
        }
        for event in later.added {
            self.add(event);
        }
    }

    /// Whether `key` refers to `event` by id or address.
    pub fn covers(event: &Event, key: &str) -> bool {
        event.id == key || event.address().is_some_and(|a| a.to_string() == key)
    }

    /// Whether `event` is affected by this diff's removals.
    pub fn removes(&self, event: &Event) -> bool {
        self.removed.iter().any(|key| Self::covers(event, key))
    }
}
