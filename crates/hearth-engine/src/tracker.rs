//! Delivery tracking by event id.
//!
//! The [`EventTracker`] records, per event id, which peers have delivered it.
//! It answers two questions for the ingestion path:
//!
//! - Have I seen this id at all? (skip re-running verification and decode)
//! - Has this exact peer delivered it before? (idempotent re-delivery guard)
//!
//! It also keeps a lineage map from container ids to the id of the payload
//! they unwrapped to, so a re-delivered envelope is recognized as already
//! opened.
//!
//! # Key Design
//!
//! - Keys: hex event ids
//! - Values: set of peer URLs (provenance)
//! - Append-only for the lifetime of the process; there is no expiry

use hearth_core::Event;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Tracker shared between the ingestion path and the components feeding it.
pub type SharedTracker = Arc<Mutex<EventTracker>>;

/// Per-id delivery provenance plus container lineage.
#[derive(Debug, Default)]
pub struct EventTracker {
    relays: HashMap<String, HashSet<String>>,
    lineage: HashMap<String, String>,
}

impl EventTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty tracker wrapped for sharing.
    pub fn shared() -> SharedTracker {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register that `peer` delivered `event`.
    ///
    /// Returns `true` if the id was already known from any peer. The peer
    /// association is recorded either way.
    pub fn add(&mut self, event: &Event, peer: &str) -> bool {
        self.add_id(&event.id, peer)
    }

    /// Like [`add`](Self::add), by id.
    pub fn add_id(&mut self, id: &str, peer: &str) -> bool {
        match self.relays.get_mut(id) {
            Some(peers) => {
                peers.insert(peer.to_string());
                true
            }
            None => {
                self.relays
                    .insert(id.to_string(), HashSet::from([peer.to_string()]));
                false
            }
        }
    }

    /// Whether `peer` has already delivered `id`.
    pub fn has(&self, id: &str, peer: &str) -> bool {
        self.relays.get(id).is_some_and(|peers| peers.contains(peer))
    }

    /// Whether `id` has been delivered by any peer.
    pub fn contains(&self, id: &str) -> bool {
        self.relays.contains_key(id)
    }

    /// Peers that delivered `id`.
    pub fn relays(&self, id: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .relays
            .get(id)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Record that container `container_id` unwrapped to `payload_id`.
    ///
    /// The payload inherits the container's provenance, so hints for where
    /// to find the payload point at the peers that carried the envelope.
    pub fn copy(&mut self, container_id: &str, payload_id: &str) {
        self.lineage
            .insert(container_id.to_string(), payload_id.to_string());

        if let Some(peers) = self.relays.get(container_id).cloned() {
            self.relays
                .entry(payload_id.to_string())
                .or_default()
                .extend(peers);
        }
    }

    /// The payload id a container was unwrapped to, if it has been.
    pub fn lineage(&self, container_id: &str) -> Option<&str> {
        self.lineage.get(container_id).map(String::as_str)
    }

    /// Statistics about the tracker.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            ids: self.relays.len(),
            deliveries: self.relays.values().map(HashSet::len).sum(),
            unwrapped: self.lineage.len(),
        }
    }
}

/// Statistics about the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    /// Distinct event ids seen.
    pub ids: usize,
    /// Distinct (id, peer) pairs seen.
    pub deliveries: usize,
    /// Containers with recorded lineage.
    pub unwrapped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::note;

    #[test]
    fn test_first_delivery_is_unseen() {
        let mut tracker = EventTracker::new();
        let e = note(1, 100);

        assert!(!tracker.add(&e, "wss://a"));
        assert!(tracker.has(&e.id, "wss://a"));
        assert!(!tracker.has(&e.id, "wss://b"));
    }

    #[test]
    fn test_second_peer_is_seen_but_recorded() {
        let mut tracker = EventTracker::new();
        let e = note(1, 100);

        assert!(!tracker.add(&e, "wss://a"));
        assert!(tracker.add(&e, "wss://b"));
        assert_eq!(tracker.relays(&e.id), vec!["wss://a", "wss://b"]);
    }

    #[test]
    fn test_same_peer_twice() {
        let mut tracker = EventTracker::new();
        let e = note(1, 100);

        tracker.add(&e, "wss://a");
        assert!(tracker.add(&e, "wss://a"));
        assert_eq!(tracker.stats().deliveries, 1);
    }

    #[test]
    fn test_copy_records_lineage_and_provenance() {
        let mut tracker = EventTracker::new();
        let wrap = note(1, 100);
        let rumor = note(2, 90);

        tracker.add(&wrap, "wss://a");
        assert!(tracker.lineage(&wrap.id).is_none());

        tracker.copy(&wrap.id, &rumor.id);
        assert_eq!(tracker.lineage(&wrap.id), Some(rumor.id.as_str()));
        assert!(tracker.has(&rumor.id, "wss://a"));
        assert_eq!(tracker.stats().unwrapped, 1);
    }
}
