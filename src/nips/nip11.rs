//! NIP-11 relay information document, served on the relay URL when the
//! client asks for `application/nostr+json`.

use serde::Serialize;

use crate::config::RelayConfig;
use crate::policy::{ModuleRegistry, NipModule};
use crate::util::unix_now;

#[derive(Debug, Clone, Default, Serialize)]
pub struct InfoDocument {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub software: String,
    pub version: String,
    pub supported_nips: Vec<u16>,
    pub limitation: Limitation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posting_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Limitation {
    pub max_message_length: usize,
    pub max_subscriptions: usize,
    pub max_filters: usize,
    pub max_limit: usize,
    pub max_subid_length: usize,
    pub max_event_tags: usize,
    pub max_content_length: usize,
    pub min_pow_difficulty: u8,
    pub auth_required: bool,
    pub payment_required: bool,
    pub restricted_writes: bool,
    pub created_at_lower_limit: u64,
    pub created_at_upper_limit: u64,
}

pub struct Nip11;

impl NipModule for Nip11 {
    fn name(&self) -> &'static str {
        "nip11"
    }

    fn nips(&self) -> &'static [u16] {
        &[11]
    }

    fn info(&self, doc: &mut InfoDocument, cfg: &RelayConfig) {
        let now = unix_now();
        doc.name = cfg.name.clone();
        doc.description = cfg.description.clone();
        doc.pubkey = cfg.pubkey.clone();
        doc.contact = cfg.contact.clone();
        doc.software = env!("CARGO_PKG_NAME").to_string();
        doc.version = env!("CARGO_PKG_VERSION").to_string();
        doc.limitation = Limitation {
            max_message_length: cfg.max_message_length,
            max_subscriptions: cfg.max_subscriptions_per_connection,
            max_filters: cfg.max_filters_per_subscription,
            max_limit: cfg.max_limit,
            max_subid_length: cfg.max_subid_length,
            max_event_tags: cfg.max_event_tags,
            max_content_length: cfg.max_content_length,
            min_pow_difficulty: 0,
            auth_required: cfg.auth_required,
            payment_required: false,
            restricted_writes: cfg.allowed_pubkeys.is_some(),
            created_at_lower_limit: cfg.created_at_lower_limit(now),
            created_at_upper_limit: cfg.created_at_upper_limit(now),
        };
    }
}

/// Assemble the document from every module's contribution.
pub fn build_info_document(registry: &ModuleRegistry, cfg: &RelayConfig) -> InfoDocument {
    let mut doc = InfoDocument::default();
    registry.apply_info(&mut doc, cfg);
    doc
}
