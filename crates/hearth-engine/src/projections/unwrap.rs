//! Opening container events.
//!
//! A container (NIP-59 gift wrap, kinds 1059 and 1060) is addressed to a
//! recipient through its `p` tag. The caller supplies which secret keys may
//! open it ([`KeyLookup`]) and how to decrypt ([`Decryptor`]). A successful
//! unwrap records a lineage edge in the tracker, so a container seen again
//! is never opened twice.
//!
//! A miss is the normal case for envelopes addressed to someone else; it is
//! counted and otherwise ignored.

use crate::error::Rejection;
use crate::tracker::SharedTracker;
use hearth_core::{Event, KIND_GIFT_WRAP, KIND_GIFT_WRAP_LEGACY};
use std::sync::Arc;

/// Decrypts one container with one key.
pub trait Decryptor: Send + Sync {
    /// The inner event, or `None` when `key` does not open `container`.
    fn try_decrypt(&self, container: &Event, key: &str) -> Option<Event>;
}

impl<F> Decryptor for F
where
    F: Fn(&Event, &str) -> Option<Event> + Send + Sync,
{
    fn try_decrypt(&self, container: &Event, key: &str) -> Option<Event> {
        self(container, key)
    }
}

/// Finds the keys that may open a container.
pub trait KeyLookup: Send + Sync {
    /// Candidate keys for `container`, usually by its recipient `p` tag.
    fn keys_for(&self, container: &Event) -> Vec<String>;
}

impl<F> KeyLookup for F
where
    F: Fn(&Event) -> Vec<String> + Send + Sync,
{
    fn keys_for(&self, container: &Event) -> Vec<String> {
        self(container)
    }
}

/// Outcome of [`Unwrapper::unwrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwrapped {
    /// Freshly opened payload.
    Rumor(Event),
    /// Opened before; holds the payload id from the lineage map.
    Already(String),
    /// No key opened it.
    Miss,
}

/// Opens containers and records their lineage.
pub struct Unwrapper {
    kinds: Vec<u16>,
    decryptor: Arc<dyn Decryptor>,
    keys: Arc<dyn KeyLookup>,
    tracker: SharedTracker,
}

impl Unwrapper {
    /// Open gift wraps (kinds 1059 and 1060).
    pub fn new(
        decryptor: Arc<dyn Decryptor>,
        keys: Arc<dyn KeyLookup>,
        tracker: SharedTracker,
    ) -> Self {
        Self {
            kinds: vec![KIND_GIFT_WRAP, KIND_GIFT_WRAP_LEGACY],
            decryptor,
            keys,
            tracker,
        }
    }

    /// Replace the container kinds.
    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Whether `event` is a container this unwrapper opens.
    pub fn handles(&self, event: &Event) -> bool {
        self.kinds.contains(&event.kind)
    }

    /// Try every candidate key on `container`.
    pub fn unwrap(&self, container: &Event) -> Unwrapped {
        if let Some(payload) = self.tracker.lock().lineage(&container.id) {
            return Unwrapped::Already(payload.to_string());
        }

        for key in self.keys.keys_for(container) {
            let Some(rumor) = self.decryptor.try_decrypt(container, &key) else {
                continue;
            };
            if let Err(e) = rumor.check_shape() {
                tracing::debug!(container = %container.id, error = %e, "Unwrapped payload is malformed");
                metrics::counter!("engine_events_invalid_total", "reason" => Rejection::Malformed.as_str())
                    .increment(1);
                return Unwrapped::Miss;
            }

            self.tracker.lock().copy(&container.id, &rumor.id);
            metrics::counter!("projection_unwrapped_total").increment(1);
            tracing::trace!(container = %container.id, rumor = %rumor.id, kind = rumor.kind, "Unwrapped");
            return Unwrapped::Rumor(rumor);
        }

        metrics::counter!("projection_decrypt_miss_total").increment(1);
        tracing::trace!(
            container = %container.id,
            reason = Rejection::DecryptionMiss.as_str(),
            "No key opened container"
        );
        Unwrapped::Miss
    }
}
