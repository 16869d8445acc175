//! Peer URL normalization.
//!
//! Requests are partitioned by peer URL, so cosmetic variants of the same
//! relay must collapse to one key.
//!
//! # Normalization Rules
//!
//! - Trim surrounding whitespace
//! - Lowercase the scheme and host
//! - Remove trailing slashes
//! - Preserve port numbers and paths
//! - Validate websocket scheme (wss:// or ws://)
//!
//! The reserved local peer URL passes through unchanged.

use super::LOCAL_RELAY_URL;
use crate::{Error, Result};
use nostr_sdk::RelayUrl;

/// Normalize a peer URL, rejecting anything that is not a websocket URL.
///
/// # Examples
///
/// ```ignore
/// use hearth_engine::relay::normalize_peer_url;
///
/// assert_eq!(
///     normalize_peer_url("wss://Relay.Example.COM/").unwrap(),
///     "wss://relay.example.com"
/// );
/// ```
pub fn normalize_peer_url(url: &str) -> Result<String> {
    let url = url.trim();

    if url == LOCAL_RELAY_URL {
        return Ok(LOCAL_RELAY_URL.to_string());
    }

    // Quick check for websocket scheme
    let lower = url.to_ascii_lowercase();
    if !lower.starts_with("wss://") && !lower.starts_with("ws://") {
        return Err(Error::InvalidPeer {
            url: url.to_string(),
            reason: "must start with wss:// or ws://".to_string(),
        });
    }

    let parsed = RelayUrl::parse(url).map_err(|e| Error::InvalidPeer {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(
            normalize_peer_url("wss://relay.example.com/").unwrap(),
            "wss://relay.example.com"
        );
        assert_eq!(
            normalize_peer_url("wss://relay.example.com///").unwrap(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_case_and_whitespace() {
        assert_eq!(
            normalize_peer_url("  WSS://Relay.Example.COM ").unwrap(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_preserves_path_and_port() {
        assert_eq!(
            normalize_peer_url("wss://relay.example.com/nostr/").unwrap(),
            "wss://relay.example.com/nostr"
        );
        assert_eq!(
            normalize_peer_url("ws://localhost:7777").unwrap(),
            "ws://localhost:7777"
        );
    }

    #[test]
    fn test_local_passes_through() {
        assert_eq!(normalize_peer_url("local://").unwrap(), LOCAL_RELAY_URL);
    }

    #[test]
    fn test_rejects_other_schemes() {
        let err = normalize_peer_url("https://relay.example.com").unwrap_err();
        assert!(matches!(err, Error::InvalidPeer { .. }));
        assert!(normalize_peer_url("relay.example.com").is_err());
    }
}
