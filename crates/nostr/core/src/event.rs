//! Minimal event shape for decoding relay traffic.

use serde::{Deserialize, Serialize};

/// A signed Nostr event as it appears on the wire.
///
/// Signature verification and event construction live with the signing
/// layer; this type only needs to round-trip the JSON shape relays send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().is_some_and(|key| key == name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}
