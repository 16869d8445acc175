//! The canonical in-memory event store.
//!
//! [`Repository`] holds at most one live record per identity key:
//!
//! - regular events by id
//! - replaceable events by `kind:pubkey:`
//! - addressable events by `kind:pubkey:d`
//!
//! Competing versions of the same identity resolve last-writer-wins on
//! `(created_at, id)`. Deletion installs tombstones that later merges of
//! older-or-equal copies cannot defeat. Every mutation returns a [`Diff`].
//!
//! [`Store`] wraps a repository with debounced change notification and
//! reactive views.

mod diff;
mod store;

pub use diff::Diff;
pub use store::{LiveQuery, Store, Subscription};

use crate::error::Rejection;
use hearth_core::{Address, Event, Filter, KIND_DELETION, KindClass};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Options for [`Repository::query`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Also return records hidden by tombstones (e.g. to render a permalink).
    pub include_deleted: bool,
}

/// Outcome of merging a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The event became the live record for its identity.
    Added,
    /// The exact event is already held.
    Duplicate,
    /// Ephemeral kinds are never retained.
    Ephemeral,
    /// Not stored; see the reason.
    Rejected(Rejection),
}

/// In-memory event store with replace, merge and delete semantics.
#[derive(Debug, Default)]
pub struct Repository {
    /// Live records by id.
    events: HashMap<String, Event>,
    /// Address string -> id of the live record, for replaceable kinds.
    addresses: HashMap<String, String>,
    by_kind: HashMap<u16, HashSet<String>>,
    by_author: HashMap<String, HashSet<String>>,
    /// Id or address -> newest deletion timestamp.
    tombstones: HashMap<String, u64>,
    /// Records hidden by tombstones, kept for `include_deleted` lookups.
    deleted: HashMap<String, Event>,
    /// Address string -> id of the newest hidden record at that address.
    deleted_addresses: HashMap<String, String>,
}

impl Repository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no records are live.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Merge a batch of events, returning the combined diff.
    pub fn merge<I>(&mut self, events: I) -> Diff
    where
        I: IntoIterator<Item = Event>,
    {
        let mut diff = Diff::default();
        for event in events {
            self.merge_counted(event, &mut diff);
        }
        metrics::gauge!("repository_live_events").set(self.events.len() as f64);
        diff
    }

    /// Merge one event, returning what happened to it.
    pub fn merge_one(&mut self, event: Event) -> (MergeOutcome, Diff) {
        let mut diff = Diff::default();
        let outcome = self.merge_counted(event, &mut diff);
        metrics::gauge!("repository_live_events").set(self.events.len() as f64);
        (outcome, diff)
    }

    fn merge_counted(&mut self, event: Event, diff: &mut Diff) -> MergeOutcome {
        let id = event.id.clone();
        let outcome = self.merge_into(event, diff);
        if let MergeOutcome::Rejected(reason) = outcome {
            metrics::counter!("repository_events_stale_total", "reason" => reason.as_str())
                .increment(1);
            tracing::trace!(id = %id, reason = reason.as_str(), "merge skipped");
        }
        outcome
    }

    fn merge_into(&mut self, event: Event, diff: &mut Diff) -> MergeOutcome {
        if event.class() == KindClass::Ephemeral {
            return MergeOutcome::Ephemeral;
        }
        if self.events.contains_key(&event.id) {
            return MergeOutcome::Duplicate;
        }
        if self.is_deleted(&event) {
            self.hide(event);
            return MergeOutcome::Rejected(Rejection::Deleted);
        }

        if let Some(address) = event.address().map(|a| a.to_string()) {
            if let Some(current) = self
                .addresses
                .get(&address)
                .and_then(|id| self.events.get(id))
            {
                if event.version_cmp(current) != Ordering::Greater {
                    return MergeOutcome::Rejected(Rejection::Stale);
                }
                let current_id = current.id.clone();
                self.unindex(&current_id);
                diff.remove(current_id);
            }
            self.addresses.insert(address, event.id.clone());
        }

        let deletion = (event.kind == KIND_DELETION).then(|| {
            let targets: Vec<String> = event
                .tag_values("e")
                .chain(event.tag_values("a"))
                .map(String::from)
                .collect();
            (targets, event.created_at)
        });

        self.index(event.clone());
        metrics::counter!("repository_events_added_total").increment(1);
        diff.add(event);

        if let Some((targets, at)) = deletion {
            self.delete_into(targets, at, diff);
        }

        MergeOutcome::Added
    }

    /// Install tombstones for ids or addresses at time `at`.
    ///
    /// Live records matching a key with `created_at <= at` are removed and
    /// reported in the diff.
    pub fn delete<I, S>(&mut self, keys: I, at: u64) -> Diff
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut diff = Diff::default();
        self.delete_into(keys.into_iter().map(Into::into), at, &mut diff);
        metrics::gauge!("repository_live_events").set(self.events.len() as f64);
        diff
    }

    fn delete_into<I>(&mut self, keys: I, at: u64, diff: &mut Diff)
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            let entry = self.tombstones.entry(key.clone()).or_insert(at);
            *entry = (*entry).max(at);
            metrics::counter!("repository_tombstones_total").increment(1);

            let target = if Address::is_address(&key) {
                self.addresses.get(&key).cloned()
            } else {
                Some(key.clone())
            };

            let Some(id) = target else { continue };
            let Some(event) = self.events.get(&id) else {
                continue;
            };
            if event.created_at > at {
                continue;
            }

            let address = event.address().map(|a| a.to_string());
            if let Some(event) = self.unindex(&id) {
                self.hide(event);
            }
            if let Some(address) = address {
                if self.addresses.get(&address) == Some(&id) {
                    self.addresses.remove(&address);
                }
                diff.remove(address);
            }
            diff.remove(id);
        }
    }

    /// Whether a tombstone covers `event` (by id or address).
    pub fn is_deleted(&self, event: &Event) -> bool {
        let covered = |key: &str| {
            self.tombstones
                .get(key)
                .is_some_and(|at| *at >= event.created_at)
        };
        covered(&event.id) || event.address().is_some_and(|a| covered(&a.to_string()))
    }

    /// Look up a record by id or address.
    pub fn get(&self, id_or_address: &str, opts: QueryOptions) -> Option<&Event> {
        if Address::is_address(id_or_address) {
            let live = self
                .addresses
                .get(id_or_address)
                .and_then(|id| self.events.get(id));
            return live.or_else(|| {
                opts.include_deleted
                    .then(|| self.deleted_addresses.get(id_or_address))
                    .flatten()
                    .and_then(|id| self.deleted.get(id))
            });
        }
        self.events.get(id_or_address).or_else(|| {
            opts.include_deleted
                .then(|| self.deleted.get(id_or_address))
                .flatten()
        })
    }

    /// All records matching any filter, newest first.
    ///
    /// Each filter's `limit` applies to that filter's own matches.
    pub fn query(&self, filters: &[Filter], opts: QueryOptions) -> Vec<Event> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut results: Vec<&Event> = Vec::new();

        for filter in filters {
            let mut matches: Vec<&Event> = self
                .candidates(filter)
                .filter(|event| filter.matches(event))
                .collect();

            if opts.include_deleted {
                matches.extend(self.deleted.values().filter(|event| filter.matches(event)));
            }

            matches.sort_by(|a, b| b.version_cmp(a));
            if let Some(limit) = filter.limit {
                matches.truncate(limit);
            }

            for event in matches {
                if seen.insert(event.id.as_str()) {
                    results.push(event);
                }
            }
        }

        results.sort_by(|a, b| b.version_cmp(a));
        results.into_iter().cloned().collect()
    }

    /// Narrow the scan using the most selective index available.
    fn candidates<'a>(&'a self, filter: &'a Filter) -> Box<dyn Iterator<Item = &'a Event> + 'a> {
        if let Some(ids) = &filter.ids {
            return Box::new(ids.iter().filter_map(move |id| self.events.get(id)));
        }
        if let Some(authors) = &filter.authors {
            return Box::new(
                authors
                    .iter()
                    .filter_map(move |author| self.by_author.get(author))
                    .flatten()
                    .filter_map(move |id| self.events.get(id)),
            );
        }
        if let Some(kinds) = &filter.kinds {
            return Box::new(
                kinds
                    .iter()
                    .filter_map(move |kind| self.by_kind.get(kind))
                    .flatten()
                    .filter_map(move |id| self.events.get(id)),
            );
        }
        Box::new(self.events.values())
    }

    /// Every live record, in no particular order.
    pub fn dump(&self) -> Vec<Event> {
        self.events.values().cloned().collect()
    }

    /// Warm-start from previously dumped events.
    pub fn load(&mut self, events: Vec<Event>) -> Diff {
        self.merge(events)
    }

    fn index(&mut self, event: Event) {
        self.by_kind
            .entry(event.kind)
            .or_default()
            .insert(event.id.clone());
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(event.id.clone());
        self.events.insert(event.id.clone(), event);
    }

    /// Keep a tombstoned record reachable by id and address.
    fn hide(&mut self, event: Event) {
        if let Some(address) = event.address().map(|a| a.to_string()) {
            let newer = self
                .deleted_addresses
                .get(&address)
                .and_then(|id| self.deleted.get(id))
                .is_none_or(|held| event.version_cmp(held) == Ordering::Greater);
            if newer {
                self.deleted_addresses.insert(address, event.id.clone());
            }
        }
        self.deleted.insert(event.id.clone(), event);
    }

    fn unindex(&mut self, id: &str) -> Option<Event> {
        let event = self.events.remove(id)?;
        if let Some(ids) = self.by_kind.get_mut(&event.kind) {
            ids.remove(id);
        }
        if let Some(ids) = self.by_author.get_mut(&event.pubkey) {
            ids.remove(id);
        }
        metrics::counter!("repository_events_removed_total").increment(1);
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addressable, deletion, event, id, note, replaceable};

    const ALL: QueryOptions = QueryOptions {
        include_deleted: false,
    };

    // =========================================================================
    // Regular events
    // =========================================================================

    #[test]
    fn test_merge_regular_events() {
        let mut repo = Repository::new();
        let diff = repo.merge([note(1, 10), note(2, 20)]);

        assert_eq!(diff.added.len(), 2);
        assert!(diff.removed.is_empty());
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_merge_duplicate_is_noop() {
        let mut repo = Repository::new();
        repo.merge([note(1, 10)]);
        let diff = repo.merge([note(1, 10)]);

        assert!(diff.is_empty());
        assert_eq!(repo.merge_one(note(1, 10)).0, MergeOutcome::Duplicate);
    }

    #[test]
    fn test_ephemeral_is_not_retained() {
        let mut repo = Repository::new();
        let (outcome, diff) = repo.merge_one(event(7, 20_001, "pk", 10, vec![]));

        assert_eq!(outcome, MergeOutcome::Ephemeral);
        assert!(diff.is_empty());
        assert!(repo.is_empty());
    }

    // =========================================================================
    // Last-writer-wins
    // =========================================================================

    #[test]
    fn test_replaceable_newer_wins() {
        let mut repo = Repository::new();
        repo.merge([replaceable(0, "pk", 1, 10)]);
        let diff = repo.merge([replaceable(0, "pk", 2, 20)]);

        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.contains(&id(1)));
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get("0:pk:", ALL).map(|e| e.id.clone()), Some(id(2)));
    }

    #[test]
    fn test_replaceable_older_is_stale() {
        let mut repo = Repository::new();
        repo.merge([replaceable(0, "pk", 2, 20)]);
        let (outcome, diff) = repo.merge_one(replaceable(0, "pk", 1, 10));

        assert_eq!(outcome, MergeOutcome::Rejected(Rejection::Stale));
        assert!(diff.is_empty());
        assert_eq!(repo.get("0:pk:", ALL).map(|e| e.id.clone()), Some(id(2)));
    }

    #[test]
    fn test_equal_timestamp_greater_id_wins_in_any_order() {
        for order in [[1u64, 2], [2, 1]] {
            let mut repo = Repository::new();
            repo.merge(order.map(|n| replaceable(3, "pk", n, 10)));
            assert_eq!(
                repo.get("3:pk:", ALL).map(|e| e.id.clone()),
                Some(id(2)),
                "order {:?}",
                order
            );
            assert_eq!(repo.len(), 1);
        }
    }

    #[test]
    fn test_addressable_scoped_by_d_tag() {
        let mut repo = Repository::new();
        repo.merge([
            addressable("pk", "a", 1, 10),
            addressable("pk", "b", 2, 10),
            addressable("pk", "a", 3, 20),
        ]);

        assert_eq!(repo.len(), 2);
        assert_eq!(
            repo.get("30023:pk:a", ALL).map(|e| e.id.clone()),
            Some(id(3))
        );
        assert_eq!(
            repo.get("30023:pk:b", ALL).map(|e| e.id.clone()),
            Some(id(2))
        );
    }

    #[test]
    fn test_one_live_record_per_identity_for_any_sequence() {
        // Every permutation of four competing versions converges on the max.
        let versions = [(1u64, 10u64), (2, 30), (3, 30), (4, 20)];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

        for order in orders {
            let mut repo = Repository::new();
            for i in order {
                let (n, ts) = versions[i];
                repo.merge([addressable("pk", "x", n, ts)]);
            }
            let live = repo.query(&[Filter::new().kinds([30023])], ALL);
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].id, id(3));
        }
    }

    // =========================================================================
    // Tombstones
    // =========================================================================

    #[test]
    fn test_delete_removes_and_reports() {
        let mut repo = Repository::new();
        repo.merge([note(1, 10)]);
        let diff = repo.delete([id(1)], 15);

        assert!(diff.removed.contains(&id(1)));
        assert!(repo.is_empty());
        assert!(repo.get(&id(1), ALL).is_none());
        assert!(
            repo.get(&id(1), QueryOptions { include_deleted: true })
                .is_some()
        );
    }

    #[test]
    fn test_deleted_id_never_reappears() {
        let mut repo = Repository::new();
        repo.delete([id(1)], 15);
        let (outcome, diff) = repo.merge_one(note(1, 10));

        assert_eq!(outcome, MergeOutcome::Rejected(Rejection::Deleted));
        assert!(diff.is_empty());
        assert!(repo.query(&[Filter::new()], ALL).is_empty());
        assert_eq!(
            repo.query(&[Filter::new()], QueryOptions { include_deleted: true })
                .len(),
            1
        );
    }

    #[test]
    fn test_address_tombstone_blocks_older_allows_newer() {
        let mut repo = Repository::new();
        repo.merge([addressable("pk", "x", 1, 100)]);
        let diff = repo.delete(["30023:pk:x"], 100);

        assert!(diff.removed.contains(&id(1)));
        assert!(diff.removed.contains("30023:pk:x"));

        // Equal timestamp stays deleted
        let (outcome, _) = repo.merge_one(addressable("pk", "x", 2, 100));
        assert_eq!(outcome, MergeOutcome::Rejected(Rejection::Deleted));
        assert!(repo.get("30023:pk:x", ALL).is_none());

        // Strictly newer supersedes the deletion
        let (outcome, diff) = repo.merge_one(addressable("pk", "x", 3, 101));
        assert_eq!(outcome, MergeOutcome::Added);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(
            repo.get("30023:pk:x", ALL).map(|e| e.id.clone()),
            Some(id(3))
        );
    }

    #[test]
    fn test_deleted_address_still_reachable_with_include_deleted() {
        let mut repo = Repository::new();
        repo.merge([addressable("pk", "x", 1, 100)]);
        repo.delete(["30023:pk:x"], 100);

        let deleted = QueryOptions {
            include_deleted: true,
        };
        assert!(repo.get("30023:pk:x", ALL).is_none());
        assert_eq!(
            repo.get("30023:pk:x", deleted).map(|e| e.id.clone()),
            Some(id(1))
        );

        // A copy rejected at merge time is reachable too, newest first
        repo.merge_one(addressable("pk", "x", 2, 100));
        assert_eq!(
            repo.get("30023:pk:x", deleted).map(|e| e.id.clone()),
            Some(id(2))
        );

        // Once a newer version is live, it wins over the hidden ones
        repo.merge_one(addressable("pk", "x", 3, 101));
        assert_eq!(
            repo.get("30023:pk:x", deleted).map(|e| e.id.clone()),
            Some(id(3))
        );
    }

    #[test]
    fn test_delete_spares_newer_record() {
        let mut repo = Repository::new();
        repo.merge([addressable("pk", "x", 1, 200)]);
        let diff = repo.delete(["30023:pk:x"], 100);

        assert!(diff.is_empty());
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_tombstones_are_monotonic() {
        let mut repo = Repository::new();
        repo.delete([id(1)], 50);
        repo.delete([id(1)], 10);
        assert!(repo.is_deleted(&note(1, 40)));
    }

    #[test]
    fn test_deletion_event_applies_tombstones() {
        let mut repo = Repository::new();
        repo.merge([note(1, 10), addressable("pk", "x", 2, 10)]);
        let diff = repo.merge([deletion(9, 20, &[id(1).as_str(), "30023:pk:x"])]);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, id(9));
        assert!(diff.removed.contains(&id(1)));
        assert!(diff.removed.contains(&id(2)));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_add_then_delete_in_one_batch_is_not_added() {
        let mut repo = Repository::new();
        let diff = repo.merge([note(1, 10), deletion(9, 20, &[id(1).as_str()])]);

        assert!(diff.added.iter().all(|e| e.id != id(1)));
        assert!(diff.removed.contains(&id(1)));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[test]
    fn test_query_newest_first_with_per_filter_limit() {
        let mut repo = Repository::new();
        repo.merge([note(1, 10), note(2, 30), note(3, 20)]);

        let results = repo.query(&[Filter::new().kinds([1]).limit(2)], ALL);
        let ids: Vec<String> = results.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![id(2), id(3)]);
    }

    #[test]
    fn test_query_disjunction_dedupes() {
        let mut repo = Repository::new();
        repo.merge([note(1, 10), note(2, 30)]);

        let results = repo.query(
            &[Filter::new().ids([id(1)]), Filter::new().kinds([1])],
            ALL,
        );
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_query_by_author_index() {
        let mut repo = Repository::new();
        repo.merge([
            event(1, 1, "alice", 10, vec![]),
            event(2, 1, "bob", 10, vec![]),
        ]);

        let results = repo.query(&[Filter::new().authors(["bob"])], ALL);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].pubkey, "bob");
    }

    #[test]
    fn test_dump_and_load() {
        let mut repo = Repository::new();
        repo.merge([note(1, 10), replaceable(0, "pk", 2, 10)]);

        let mut restored = Repository::new();
        let diff = restored.load(repo.dump());
        assert_eq!(diff.added.len(), 2);
        assert_eq!(restored.len(), 2);
    }
}
