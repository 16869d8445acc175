//! Client-side Nostr event synchronization and caching engine.
//!
//! This crate ingests events from many untrusted peers, reconciles them into
//! one consistent local store, and serves queries, reactive views and
//! paginated feeds.
//!
//! # Modules
//!
//! - [`tracker`] - Per-id delivery provenance and container lineage
//! - [`repository`] - Last-writer-wins store with tombstones and debounced diffs
//! - [`relay`] - The peer connection seam, the virtual relay and the nostr-sdk pool
//! - [`request`] - Coalesced loads, pagination cursors and feeds
//! - [`projections`] - Per-kind and global handlers, container unwrapping
//! - [`engine`] - The facade wiring them together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │      Peers      │  (remote relays via nostr-sdk, local virtual relay)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Loader      │  One query per peer per flush, fan-out per requester
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    Ingestor     │  Shape check, verify, EventTracker
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐       ┌─────────────────┐
//! │      Store      │──────▶│   Projections   │  Derived state, unwrap
//! └────────┬────────┘       └─────────────────┘
//!          │ debounced diffs
//!          ▼
//! ┌─────────────────┐
//! │ Views and feeds │  LiveQuery, FeedLoader
//! └─────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod projections;
pub mod relay;
pub mod repository;
pub mod request;
pub mod schedule;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use engine::{Engine, Ingestor};
pub use error::{Error, Rejection, Result};
pub use projections::{
    Decryptor, HighWaterMarks, KeyLookup, Projections, TopicIndex, TopicStats, Unwrapped,
    Unwrapper,
};
pub use relay::{
    LOCAL_RELAY_URL, MessageReceiver, NostrPool, PeerMessage, PeerRouter, Query, RelayConnection,
    VirtualRelay, normalize_peer_url,
};
pub use repository::{
    Diff, LiveQuery, MergeOutcome, QueryOptions, Repository, Store, Subscription,
};
pub use request::{
    Cursor, FeedBuilder, FeedItem, FeedLoader, FeedOptions, Ingest, LoadHandle, LoadRequest,
    Loader, MultiCursor,
};
pub use tracker::{EventTracker, SharedTracker, TrackerStats};
