//! Handlers shipped with the engine.

use super::Projections;
use hearth_core::{Event, KIND_LABEL, KIND_TEXT_NOTE};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

/// Inline `#hashtag` in note content.
static HASHTAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(\w{2,100})").expect("hashtag regex should compile"));

/// Label namespace marking a topic label.
const TOPIC_NAMESPACE: &str = "#t";

/// Newest `(created_at, id)` applied per key.
///
/// A handler calls [`advance`](Self::advance) before mutating state for a
/// key and skips the update when it returns `false`, so replays and late
/// stale copies never roll derived state back.
#[derive(Debug, Default)]
pub struct HighWaterMarks {
    marks: HashMap<String, (u64, String)>,
}

impl HighWaterMarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the mark for `key` to `event` if it is strictly newer.
    pub fn advance(&mut self, key: &str, event: &Event) -> bool {
        let candidate = (event.created_at, event.id.as_str());
        match self.marks.get_mut(key) {
            Some(mark) if (mark.0, mark.1.as_str()) >= candidate => false,
            Some(mark) => {
                *mark = (event.created_at, event.id.clone());
                true
            }
            None => {
                self.marks
                    .insert(key.to_string(), (event.created_at, event.id.clone()));
                true
            }
        }
    }

    /// `created_at` of the newest event applied for `key`.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.marks.get(key).map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

/// Usage of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStats {
    pub name: String,
    /// Events mentioning the topic.
    pub count: u64,
    /// Newest `created_at` among them.
    pub last_seen: u64,
}

/// Hashtag usage across notes and topic labels.
///
/// Topics come from kind-1 `t` tags and `#word` content, and from kind-1985
/// labels in the `#t` namespace. Names are lowercased.
#[derive(Debug, Default)]
pub struct TopicIndex {
    topics: HashMap<String, TopicStats>,
    marks: HighWaterMarks,
    counted: HashSet<String>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared index with `projections`.
    pub fn attach(projections: &mut Projections) -> Arc<Mutex<TopicIndex>> {
        let index = Arc::new(Mutex::new(TopicIndex::new()));
        for kind in [KIND_TEXT_NOTE, KIND_LABEL] {
            let index = index.clone();
            projections.add_handler(kind, move |event| index.lock().handle(event));
        }
        index
    }

    /// Count the topics of `event`. Repeated events are ignored.
    pub fn handle(&mut self, event: &Event) {
        if !self.counted.insert(event.id.clone()) {
            return;
        }

        for name in topics_of(event) {
            let stats = self.topics.entry(name.clone()).or_insert_with(|| TopicStats {
                name: name.clone(),
                count: 0,
                last_seen: 0,
            });
            stats.count += 1;
            if self.marks.advance(&name, event) {
                stats.last_seen = event.created_at;
            }
        }
    }

    /// Stats for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&TopicStats> {
        self.topics.get(&name.to_lowercase())
    }

    /// All topics, most used first, then most recent.
    pub fn topics(&self) -> Vec<TopicStats> {
        let mut topics: Vec<TopicStats> = self.topics.values().cloned().collect();
        topics.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.name.cmp(&b.name))
        });
        topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Distinct lowercased topic names of `event`.
fn topics_of(event: &Event) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    match event.kind {
        KIND_TEXT_NOTE => {
            names.extend(
                event
                    .tag_values("t")
                    .map(|t| t.trim_start_matches('#').to_lowercase()),
            );
            let content = event.content.to_lowercase();
            names.extend(
                HASHTAG_REGEX
                    .captures_iter(&content)
                    .filter_map(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            );
        }
        KIND_LABEL => {
            names.extend(
                event
                    .tags
                    .iter()
                    .filter(|tag| {
                        tag.len() >= 3
                            && tag[0] == "l"
                            && tag.last().map(String::as_str) == Some(TOPIC_NAMESPACE)
                    })
                    .map(|tag| tag[1].to_lowercase()),
            );
        }
        _ => {}
    }
    names.retain(|name| !name.is_empty());
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::{author, event, note};
    use tokio::time::Instant;

    fn tagged(n: u64, created_at: u64, content: &str, tags: Vec<Vec<&str>>) -> Event {
        let mut e = event(n, KIND_TEXT_NOTE, &author(), created_at, tags);
        e.content = content.to_string();
        e
    }

    // =========================================================================
    // High-water marks
    // =========================================================================

    #[test]
    fn test_marks_only_advance() {
        let mut marks = HighWaterMarks::new();
        assert!(marks.advance("k", &note(2, 100)));
        assert!(!marks.advance("k", &note(2, 100)), "replay");
        assert!(!marks.advance("k", &note(1, 100)), "lower id at same time");
        assert!(!marks.advance("k", &note(9, 90)), "older");
        assert!(marks.advance("k", &note(3, 100)));
        assert!(marks.advance("k", &note(1, 110)));
        assert_eq!(marks.get("k"), Some(110));
        assert_eq!(marks.len(), 1);
    }

    // =========================================================================
    // Topics
    // =========================================================================

    #[test]
    fn test_topics_from_tags_and_content() {
        let mut index = TopicIndex::new();
        index.handle(&tagged(1, 100, "hello #Rust and #a", vec![vec!["t", "nostr"], vec!["t", "rust"]]));

        let rust = index.get("RUST").unwrap();
        assert_eq!(rust.count, 1, "tag and content count once per event");
        assert_eq!(rust.last_seen, 100);
        assert!(index.get("nostr").is_some());
        assert!(index.get("a").is_none(), "single letters are not hashtags");
    }

    #[test]
    fn test_labels_in_topic_namespace() {
        let mut index = TopicIndex::new();
        let label = event(
            2,
            KIND_LABEL,
            &author(),
            50,
            vec![vec!["L", "#t"], vec!["l", "Bitcoin", "#t"], vec!["l", "spam", "ugc"]],
        );
        index.handle(&label);

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("bitcoin").unwrap().count, 1);
    }

    #[test]
    fn test_replayed_and_stale_events() {
        let mut index = TopicIndex::new();
        index.handle(&tagged(1, 100, "#rust", vec![]));
        index.handle(&tagged(1, 100, "#rust", vec![]));
        index.handle(&tagged(2, 80, "#rust", vec![]));

        let rust = index.get("rust").unwrap();
        assert_eq!(rust.count, 2);
        assert_eq!(rust.last_seen, 100, "older note does not move last_seen back");
    }

    #[test]
    fn test_attach_and_ranking() {
        let mut projections = Projections::new(&EngineConfig::default());
        let index = TopicIndex::attach(&mut projections);

        let now = Instant::now();
        projections.push(tagged(1, 100, "#rust #nostr", vec![]), now);
        projections.push(tagged(2, 120, "#rust", vec![]), now);
        projections.push(tagged(3, 130, "#zig", vec![]), now);

        let names: Vec<String> = index.lock().topics().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["rust", "zig", "nostr"]);
    }
}
