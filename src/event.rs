//! The canonical Nostr event record (NIP-01) and the kind classification
//! that drives storage policy.

use once_cell::sync::Lazy;
use secp256k1::schnorr::Signature;
use secp256k1::{All, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// A signed Nostr event. The only first-class datum the relay handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Storage class of an event kind (NIP-01/16/33 ranges).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

impl KindClass {
    pub fn classify(kind: u16) -> Self {
        match kind {
            0 | 3 => KindClass::Replaceable,
            10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::Addressable,
            _ => KindClass::Regular,
        }
    }
}

impl Event {
    /// Compact JSON array `[0,pubkey,created_at,kind,tags,content]` hashed
    /// to produce the event id. Serde tuples serialize as JSON arrays with
    /// no whitespace, which is exactly the NIP-01 canonical form.
    pub fn canonical_serialization(&self) -> String {
        serde_json::to_string(&(
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .unwrap_or_default()
    }

    /// Lowercase hex sha256 of the canonical serialization.
    pub fn compute_id(&self) -> String {
        let digest = Sha256::digest(self.canonical_serialization().as_bytes());
        hex::encode(digest)
    }

    pub fn verify_id(&self) -> bool {
        self.compute_id() == self.id
    }

    /// Schnorr verification of `sig` over the `id` digest under the x-only
    /// `pubkey`. Shape must already have been validated; bad hex fails here.
    pub fn verify_signature(&self) -> bool {
        let Ok(id_bytes) = hex::decode(&self.id) else {
            return false;
        };
        let Ok(digest) = <[u8; 32]>::try_from(id_bytes.as_slice()) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.sig) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let Ok(pk_bytes) = hex::decode(&self.pubkey) else {
            return false;
        };
        let Ok(pubkey) = XOnlyPublicKey::from_slice(&pk_bytes) else {
            return false;
        };
        let msg = Message::from_digest(digest);
        SECP.verify_schnorr(&sig, &msg, &pubkey).is_ok()
    }

    /// Structural checks: hex field lengths and charsets, non-empty tags.
    /// Returns the failure in wire-ready words (caller prefixes `invalid:`).
    pub fn validate_shape(&self) -> Result<(), &'static str> {
        if !is_lower_hex(&self.id, 64) {
            return Err("id must be 64 lowercase hex characters");
        }
        if !is_lower_hex(&self.pubkey, 64) {
            return Err("pubkey must be 64 lowercase hex characters");
        }
        if !is_lower_hex(&self.sig, 128) {
            return Err("sig must be 128 lowercase hex characters");
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err("tags must be non-empty arrays of strings");
        }
        Ok(())
    }

    pub fn kind_class(&self) -> KindClass {
        KindClass::classify(self.kind)
    }

    /// First value of the first `d` tag; addressable events with no `d`
    /// tag key on the empty string.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// NIP-40 expiration timestamp, if the event carries one.
    pub fn expiration(&self) -> Option<u64> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("expiration"))
            .and_then(|t| t.get(1))
            .and_then(|v| v.parse().ok())
    }

    /// NIP-70: a bare `["-"]` tag marks the event as protected.
    pub fn is_protected(&self) -> bool {
        self.tags
            .iter()
            .any(|t| t.len() == 1 && t[0] == "-")
    }

    /// Values of every tag whose name is `name` (second element only,
    /// the one indexed filters match on).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
