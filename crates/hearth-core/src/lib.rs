//! Core types and shared utilities for the hearth sync engine.
//!
//! This crate provides:
//! - The [`Event`] model with kind classes, addresses and NIP-10 reply resolution
//! - Conjunctive [`Filter`]s, disjunctive matching and filter combination
//! - The [`Verifier`] capability, with a nostr-crate backed implementation
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
mod filter;
pub mod metrics;
mod verify;

pub use error::{Error, Result};
pub use event::{
    Address, Event, KIND_CONTACTS, KIND_DELETION, KIND_GIFT_WRAP, KIND_GIFT_WRAP_LEGACY,
    KIND_LABEL, KIND_METADATA, KIND_TEXT_NOTE, KindClass,
};
pub use filter::{Filter, combine_filters, matches_any};
pub use verify::{NostrVerifier, TrustAll, Verifier};

/// Current Unix time in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
