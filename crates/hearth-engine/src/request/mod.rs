//! Outbound requests: coalesced loads, pagination cursors and feeds.
//!
//! ```text
//! FeedLoader ──▶ MultiCursor ──┐
//!                              ├──▶ Loader ──▶ RelayConnection (one query per peer per flush)
//! other callers ───────────────┘      │
//!                                     ▼
//!                                  Ingest (verify, track, merge, project)
//! ```

mod cursor;
mod feed;
mod load;

pub use cursor::{Cursor, MultiCursor};
pub use feed::{FeedBuilder, FeedItem, FeedLoader, FeedOptions};
pub use load::{LoadHandle, LoadRequest, Loader};

use hearth_core::Event;

/// Where the loader hands each first-delivered (event, peer) pair.
///
/// Returns `false` when the event was rejected; rejected events are not
/// forwarded to requesters.
pub trait Ingest: Send + Sync {
    /// Process one delivered event.
    fn ingest(&self, event: &Event, peer: &str) -> bool;
}

impl<F> Ingest for F
where
    F: Fn(&Event, &str) -> bool + Send + Sync,
{
    fn ingest(&self, event: &Event, peer: &str) -> bool {
        self(event, peer)
    }
}
