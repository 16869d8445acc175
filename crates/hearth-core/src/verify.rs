//! Event verification capability.
//!
//! The engine never checks signatures itself. It asks a [`Verifier`] before
//! an event is merged; [`NostrVerifier`] is the production implementation
//! backed by the nostr crate (id = SHA-256 of the canonical serialization,
//! Schnorr signature over secp256k1).

use crate::event::Event;
use nostr::JsonUtil; // Required for Event::from_json()

/// Decides whether an event is authentic.
pub trait Verifier: Send + Sync {
    /// Returns `true` if the event's id and signature are valid.
    fn verify(&self, event: &Event) -> bool;
}

/// Full NIP-01 verification using the nostr crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NostrVerifier;

impl Verifier for NostrVerifier {
    fn verify(&self, event: &Event) -> bool {
        let Ok(json) = event.to_json() else {
            return false;
        };
        match nostr::Event::from_json(&json) {
            Ok(parsed) => parsed.verify_id() && parsed.verify_signature(),
            Err(e) => {
                tracing::trace!(id = %event.id, error = %e, "event failed to parse for verification");
                false
            }
        }
    }
}

/// Accepts everything. For trusted local sources and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustAll;

impl Verifier for TrustAll {
    fn verify(&self, _event: &Event) -> bool {
        true
    }
}

impl<F> Verifier for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn verify(&self, event: &Event) -> bool {
        self(event)
    }
}
