//! Error types for the hearth data model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or validating events and filters.
#[derive(Error, Debug)]
pub enum Error {
    /// Event has an invalid field format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Address string is not of the form `kind:pubkey:identifier`.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// Event signature or id did not verify.
    #[error("invalid event signature: {0}")]
    InvalidSignature(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nostr library error (for crypto operations).
    #[error("nostr error: {0}")]
    Nostr(#[from] nostr::event::Error),
}
