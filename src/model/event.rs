//! Validated, storable Nostr events (§3).
//!
//! Signature verification and canonical event serialization are delegated
//! to the `nostr` crate per the specification's scope boundary ("the Nostr
//! protocol primitives themselves ... assumed available as a library").
//! This module owns only the archival-specific invariants: the sync-window
//! check, the NUL-byte content guard, and the derived `tagvalues` used for
//! containment indexing.

use nostr::event::Event as NostrEvent;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("signature does not verify")]
    BadSignature,
    #[error("created_at {created_at} outside sync window [{start}, {end}]")]
    OutsideWindow { created_at: i64, start: i64, end: i64 },
    #[error("content or tags contain a NUL byte")]
    NulByte,
}

/// A Nostr event accepted for archival. Immutable; `tagvalues` is computed
/// once at construction.
#[derive(Debug, Clone)]
pub struct Event {
    id: [u8; 32],
    pubkey: [u8; 32],
    sig: [u8; 64],
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    tagvalues: Vec<String>,
}

impl Event {
    /// Validates `event` against the sync window `[window_start,
    /// window_end]` (inclusive), verifies its signature, and rejects NUL
    /// bytes in content or tag values.
    pub fn from_nostr_event(
        event: &NostrEvent,
        window_start: i64,
        window_end: i64,
    ) -> Result<Self, EventError> {
        if !event.verify().is_ok() {
            return Err(EventError::BadSignature);
        }

        let created_at = event.created_at.as_u64() as i64;
        if created_at < window_start || created_at > window_end {
            return Err(EventError::OutsideWindow {
                created_at,
                start: window_start,
                end: window_end,
            });
        }

        if event.content.contains('\0') {
            return Err(EventError::NulByte);
        }

        let tags: Vec<Vec<String>> = event
            .tags
            .iter()
            .map(|t| t.clone().to_vec())
            .collect();

        for tag in &tags {
            for value in tag {
                if value.contains('\0') {
                    return Err(EventError::NulByte);
                }
            }
        }

        let tagvalues = derive_tagvalues(&tags);

        Ok(Self {
            id: event.id.to_bytes(),
            pubkey: event.pubkey.to_bytes(),
            sig: event.sig.as_ref().try_into().unwrap_or([0u8; 64]),
            created_at,
            kind: event.kind.as_u16(),
            tags,
            content: event.content.clone(),
            tagvalues,
        })
    }

    pub fn id(&self) -> &[u8; 32] {
        &self.id
    }
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
    pub fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.pubkey)
    }
    pub fn sig(&self) -> &[u8; 64] {
        &self.sig
    }
    pub fn sig_hex(&self) -> String {
        hex::encode(self.sig)
    }
    pub fn created_at(&self) -> i64 {
        self.created_at
    }
    pub fn kind(&self) -> u16 {
        self.kind
    }
    pub fn tags(&self) -> &[Vec<String>] {
        &self.tags
    }
    pub fn content(&self) -> &str {
        &self.content
    }
    pub fn tagvalues(&self) -> &[String] {
        &self.tagvalues
    }
}

/// Flattens the values of single-character-keyed tags, used for relay-URL
/// extraction in Finder (§4.4) and for containment indexing (§3).
fn derive_tagvalues(tags: &[Vec<String>]) -> Vec<String> {
    tags.iter()
        .filter(|t| t.first().map(|k| k.len() == 1).unwrap_or(false))
        .filter_map(|t| t.get(1).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagvalues_only_includes_single_char_keys() {
        let tags = vec![
            vec!["p".to_string(), "abcd".to_string()],
            vec!["relay".to_string(), "wss://x".to_string()],
            vec!["e".to_string(), "1234".to_string()],
        ];
        let values = derive_tagvalues(&tags);
        assert_eq!(values, vec!["abcd".to_string(), "1234".to_string()]);
    }
}
