//! The event data model.
//!
//! [`Event`] mirrors the NIP-01 wire object. The engine never mutates an
//! event once constructed; identity and supersession rules are derived from
//! the `kind` via [`KindClass`]:
//!
//! - Regular: identity is the event id, never superseded
//! - Replaceable: identity is `(kind, pubkey)`
//! - Addressable: identity is `(kind, pubkey, d-tag)`
//! - Ephemeral: delivered but never retained

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Profile metadata.
pub const KIND_METADATA: u16 = 0;
/// Short text note.
pub const KIND_TEXT_NOTE: u16 = 1;
/// Follow list.
pub const KIND_CONTACTS: u16 = 3;
/// Deletion request (NIP-09).
pub const KIND_DELETION: u16 = 5;
/// Label (NIP-32).
pub const KIND_LABEL: u16 = 1985;
/// Gift wrap envelope (NIP-59).
pub const KIND_GIFT_WRAP: u16 = 1059;
/// Legacy NIP-04 wrapped envelope.
pub const KIND_GIFT_WRAP_LEGACY: u16 = 1060;

/// Behavioral family of an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    /// Identity is the event id.
    Regular,
    /// Identity is `(kind, pubkey)`; latest wins.
    Replaceable,
    /// Not meant to be stored.
    Ephemeral,
    /// Identity is `(kind, pubkey, d-tag)`; latest wins.
    Addressable,
}

impl KindClass {
    /// Classify a kind number per NIP-01.
    pub fn of(kind: u16) -> Self {
        match kind {
            0 | 3 | 10_000..=19_999 => Self::Replaceable,
            20_000..=29_999 => Self::Ephemeral,
            30_000..=39_999 => Self::Addressable,
            _ => Self::Regular,
        }
    }

    /// Whether events of this class are superseded by newer ones.
    pub fn is_replaceable(self) -> bool {
        matches!(self, Self::Replaceable | Self::Addressable)
    }
}

/// A signed (or, for unwrapped rumors, unsigned) Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// Hex-encoded SHA-256 of the canonical serialization.
    pub id: String,
    /// Hex-encoded author public key.
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tag arrays, e.g. `["e", "<id>", "<relay>", "reply"]`.
    pub tags: Vec<Vec<String>>,
    /// Free-form content.
    pub content: String,
    /// Hex-encoded Schnorr signature. Empty for rumors.
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Parse an event from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Event = serde_json::from_str(json)?;
        event.check_shape()?;
        Ok(event)
    }

    /// Serialize this event to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check the structural shape of the event (hex lengths, tag arity).
    ///
    /// This does not verify the id hash or the signature; see
    /// [`crate::Verifier`] for that.
    pub fn check_shape(&self) -> Result<()> {
        if !is_hex_of_len(&self.id, 64) {
            return Err(Error::InvalidField {
                field: "id",
                reason: "not 64 hex characters".to_string(),
            });
        }
        if !is_hex_of_len(&self.pubkey, 64) {
            return Err(Error::InvalidField {
                field: "pubkey",
                reason: "not 64 hex characters".to_string(),
            });
        }
        if !self.sig.is_empty() && !is_hex_of_len(&self.sig, 128) {
            return Err(Error::InvalidField {
                field: "sig",
                reason: "not 128 hex characters".to_string(),
            });
        }
        if self.tags.iter().any(|tag| tag.is_empty()) {
            return Err(Error::InvalidField {
                field: "tags",
                reason: "empty tag array".to_string(),
            });
        }
        Ok(())
    }

    /// The behavioral family of this event's kind.
    pub fn class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Iterate over the values (second element) of tags named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// First value of the tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tag_values(name).next()
    }

    /// The `d` tag identifier. Missing `d` tags count as the empty string.
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// The address of this event, for replaceable and addressable kinds.
    pub fn address(&self) -> Option<Address> {
        match self.class() {
            KindClass::Replaceable => Some(Address {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
                identifier: String::new(),
            }),
            KindClass::Addressable => Some(Address {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
                identifier: self.identifier().to_string(),
            }),
            KindClass::Regular | KindClass::Ephemeral => None,
        }
    }

    /// The key under which at most one live record may exist.
    ///
    /// This is the id for regular events and the address string otherwise.
    pub fn identity_key(&self) -> String {
        match self.address() {
            Some(address) => address.to_string(),
            None => self.id.clone(),
        }
    }

    /// The id plus, when present, the address string.
    pub fn id_and_address(&self) -> Vec<String> {
        let mut keys = vec![self.id.clone()];
        if let Some(address) = self.address() {
            keys.push(address.to_string());
        }
        keys
    }

    /// Order used for last-writer-wins: greater `created_at`, then greater id.
    pub fn version_cmp(&self, other: &Event) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// The id of the event this one replies to, per NIP-10.
    ///
    /// Marked `reply` tags win, then marked `root`, then the last unmarked
    /// `e` tag (deprecated positional scheme). `mention` tags never count.
    pub fn reply_id(&self) -> Option<&str> {
        let e_tags: Vec<&Vec<String>> = self
            .tags
            .iter()
            .filter(|tag| tag.first().map(String::as_str) == Some("e") && tag.len() >= 2)
            .collect();

        let marked = |marker: &str| {
            e_tags
                .iter()
                .find(|tag| tag.get(3).map(String::as_str) == Some(marker))
                .map(|tag| tag[1].as_str())
        };

        if let Some(id) = marked("reply").or_else(|| marked("root")) {
            return Some(id);
        }

        e_tags
            .iter()
            .rev()
            .find(|tag| tag.get(3).is_none_or(|marker| marker.is_empty()))
            .map(|tag| tag[1].as_str())
    }
}

/// Convert a `nostr::Event` into the engine's event model.
impl From<&nostr::Event> for Event {
    fn from(event: &nostr::Event) -> Self {
        Self {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            created_at: event.created_at.as_secs(),
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().iter().map(|s| s.to_string()).collect())
                .collect(),
            content: event.content.clone(),
            sig: event.sig.to_string(),
        }
    }
}

/// The address of one replaceable or addressable record: `kind:pubkey:d`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    /// Event kind.
    pub kind: u16,
    /// Author public key (hex).
    pub pubkey: String,
    /// `d` tag value; empty for plain replaceable kinds.
    pub identifier: String,
}

impl Address {
    /// Whether `value` looks like an address rather than an event id.
    pub fn is_address(value: &str) -> bool {
        value.contains(':')
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(kind), Some(pubkey), Some(identifier)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidAddress(s.to_string()));
        };
        let kind = kind
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        if pubkey.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(Self {
            kind,
            pubkey: pubkey.to_string(),
            identifier: identifier.to_string(),
        })
    }
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn event(kind: u16, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: hex('a'),
            pubkey: hex('b'),
            created_at: 1_700_000_000,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    // =========================================================================
    // Kind classification
    // =========================================================================

    #[test]
    fn test_kind_classes() {
        assert_eq!(KindClass::of(1), KindClass::Regular);
        assert_eq!(KindClass::of(0), KindClass::Replaceable);
        assert_eq!(KindClass::of(3), KindClass::Replaceable);
        assert_eq!(KindClass::of(10_002), KindClass::Replaceable);
        assert_eq!(KindClass::of(20_001), KindClass::Ephemeral);
        assert_eq!(KindClass::of(30_023), KindClass::Addressable);
        assert_eq!(KindClass::of(40_000), KindClass::Regular);
    }

    // =========================================================================
    // Identity
    // =========================================================================

    #[test]
    fn test_identity_key_regular_is_id() {
        let e = event(1, vec![]);
        assert_eq!(e.identity_key(), hex('a'));
        assert!(e.address().is_none());
    }

    #[test]
    fn test_identity_key_replaceable_has_empty_identifier() {
        let e = event(0, vec![vec!["d", "ignored"]]);
        assert_eq!(e.identity_key(), format!("0:{}:", hex('b')));
    }

    #[test]
    fn test_identity_key_addressable_uses_d_tag() {
        let e = event(30_023, vec![vec!["d", "post"]]);
        assert_eq!(e.identity_key(), format!("30023:{}:post", hex('b')));
        assert_eq!(e.id_and_address().len(), 2);
    }

    #[test]
    fn test_address_round_trip_with_colon_in_identifier() {
        let address: Address = format!("30023:{}:a:b", hex('b')).parse().unwrap();
        assert_eq!(address.identifier, "a:b");
        assert_eq!(address.to_string(), format!("30023:{}:a:b", hex('b')));
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("nope".parse::<Address>().is_err());
        assert!("x:y:z".parse::<Address>().is_err());
    }

    #[test]
    fn test_version_cmp_tie_breaks_on_id() {
        let mut a = event(0, vec![]);
        let mut b = event(0, vec![]);
        a.id = hex('1');
        b.id = hex('2');
        assert_eq!(a.version_cmp(&b), Ordering::Less);
        b.created_at -= 1;
        assert_eq!(a.version_cmp(&b), Ordering::Greater);
    }

    // =========================================================================
    // Reply resolution
    // =========================================================================

    #[test]
    fn test_reply_id_prefers_reply_marker() {
        let e = event(
            1,
            vec![
                vec!["e", "root", "", "root"],
                vec!["e", "parent", "", "reply"],
            ],
        );
        assert_eq!(e.reply_id(), Some("parent"));
    }

    #[test]
    fn test_reply_id_falls_back_to_root() {
        let e = event(1, vec![vec!["e", "root", "", "root"], vec!["e", "m", "", "mention"]]);
        assert_eq!(e.reply_id(), Some("root"));
    }

    #[test]
    fn test_reply_id_positional() {
        let e = event(1, vec![vec!["e", "first"], vec!["e", "last"]]);
        assert_eq!(e.reply_id(), Some("last"));
    }

    #[test]
    fn test_reply_id_ignores_mentions() {
        let e = event(1, vec![vec!["e", "m", "", "mention"]]);
        assert_eq!(e.reply_id(), None);
    }

    // =========================================================================
    // Shape checks
    // =========================================================================

    #[test]
    fn test_from_json_rejects_short_id() {
        let json = r#"{"id":"abc","pubkey":"bb","created_at":1,"kind":1,"tags":[],"content":""}"#;
        let err = Event::from_json(json).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "id", .. }));
    }

    #[test]
    fn test_from_json_accepts_unsigned_rumor() {
        let e = event(14, vec![vec!["p", "x"]]);
        let parsed = Event::from_json(&e.to_json().unwrap()).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn test_empty_tag_is_malformed() {
        let mut e = event(1, vec![]);
        e.tags.push(vec![]);
        assert!(e.check_shape().is_err());
    }
}
