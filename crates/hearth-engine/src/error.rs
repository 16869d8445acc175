//! Error types for the sync engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by engine operations.
///
/// Per-event problems never show up here; they are classified as a
/// [`Rejection`] and dropped.
#[derive(Error, Debug)]
pub enum Error {
    /// Data model error.
    #[error(transparent)]
    Core(#[from] hearth_core::Error),

    /// Nostr SDK error.
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Peer URL could not be used.
    #[error("invalid peer URL '{url}': {reason}")]
    InvalidPeer {
        /// The URL as given.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A filter could not be expressed on the wire.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// The peer connection is gone.
    #[error("connection to {0} closed")]
    ConnectionClosed(String),

    /// The component was stopped before the operation completed.
    #[error("stopped")]
    Stopped,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Why a single delivered event was not processed.
///
/// These are expected in normal operation and are only logged and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Unparseable content or tags.
    Malformed,
    /// Signature or id did not verify.
    Unverified,
    /// No key could open a container event.
    DecryptionMiss,
    /// Older than the held version of the same record.
    Stale,
    /// Covered by a tombstone.
    Deleted,
}

impl Rejection {
    /// Label value used in metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Unverified => "unverified",
            Self::DecryptionMiss => "decryption_miss",
            Self::Stale => "stale",
            Self::Deleted => "deleted",
        }
    }
}
