//! Conjunctive event filters (NIP-01 `REQ` filters).
//!
//! A [`Filter`] matches an event iff every field that is present is
//! satisfied. A query is a slice of filters, matched disjunctively by
//! [`matches_any`].

use crate::event::{Address, Event};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single conjunctive predicate over events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<String>>,

    /// Author public keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<String>>,

    /// Event kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,

    /// Tag selectors keyed by `#<letter>`, e.g. `"#e"`.
    #[serde(flatten)]
    pub tags: BTreeMap<String, BTreeSet<String>>,

    /// Lower bound on `created_at` (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Upper bound on `created_at` (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events a relay should return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// An empty filter, matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given ids.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids
            .get_or_insert_with(BTreeSet::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Restrict to the given authors.
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .extend(authors.into_iter().map(Into::into));
        self
    }

    /// Restrict to the given kinds.
    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Restrict to events carrying a `name` tag with one of `values`.
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{name}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Set the lower time bound.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Set the upper time bound.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Set the result limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filters selecting each value, treating `kind:pubkey:d` strings as
    /// addresses and everything else as event ids.
    pub fn for_ids_or_addresses<I, S>(values: I) -> Vec<Filter>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids = BTreeSet::new();
        let mut filters = Vec::new();

        for value in values {
            let value = value.as_ref();
            if Address::is_address(value) {
                if let Ok(address) = value.parse::<Address>() {
                    filters.push(
                        Filter::new()
                            .kinds([address.kind])
                            .authors([address.pubkey])
                            .tag('d', [address.identifier]),
                    );
                }
            } else {
                ids.insert(value.to_string());
            }
        }

        if !ids.is_empty() {
            filters.insert(0, Filter::new().ids(ids));
        }

        filters
    }

    /// Whether `event` satisfies every present constraint.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.contains(&event.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }
        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            // Replaceable events without a d tag match `#d: [""]`.
            if name == "d" && values.contains("") && event.tag_value("d").is_none() {
                return true;
            }
            event.tag_values(name).any(|v| values.contains(v))
        })
    }

    /// The set of constrained fields plus `until`; filters sharing a shape
    /// can be merged by [`combine_filters`].
    fn shape(&self) -> (Vec<&str>, Option<u64>) {
        let mut keys = Vec::new();
        if self.ids.is_some() {
            keys.push("ids");
        }
        if self.authors.is_some() {
            keys.push("authors");
        }
        if self.kinds.is_some() {
            keys.push("kinds");
        }
        keys.extend(self.tags.keys().map(String::as_str));
        (keys, self.until)
    }

    fn absorb(&mut self, other: &Filter) {
        fn union<T: Ord + Clone>(a: &mut Option<BTreeSet<T>>, b: &Option<BTreeSet<T>>) {
            if let (Some(a), Some(b)) = (a.as_mut(), b.as_ref()) {
                a.extend(b.iter().cloned());
            }
        }

        union(&mut self.ids, &other.ids);
        union(&mut self.authors, &other.authors);
        union(&mut self.kinds, &other.kinds);
        for (key, values) in &other.tags {
            self.tags
                .entry(key.clone())
                .or_default()
                .extend(values.iter().cloned());
        }

        self.since = match (self.since, other.since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        self.limit = match (self.limit, other.limit) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
    }
}

/// Whether `event` matches at least one of `filters`.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

/// Merge filters that constrain the same fields and share `until`.
///
/// Value sets are unioned, `since` widens to the minimum and `limit` to the
/// sum (an absent bound on either side stays absent). Filters of different
/// shapes are kept side by side, so the result is still a disjunction
/// covering every input.
pub fn combine_filters(filters: &[Filter]) -> Vec<Filter> {
    let mut combined: Vec<Filter> = Vec::new();

    for filter in filters {
        match combined.iter_mut().find(|c| c.shape() == filter.shape()) {
            Some(existing) => existing.absorb(filter),
            None => combined.push(filter.clone()),
        }
    }

    combined
}
