//! NIP-42 authentication. The relay hands every new connection a random
//! challenge; the client proves key ownership with a signed kind-22242
//! event carrying that challenge and the relay's URL.

use crate::config::RelayConfig;
use crate::event::Event;
use crate::policy::{ConnectionSnapshot, NipModule, Policy, Verdict};

pub const KIND_CLIENT_AUTH: u16 = 22_242;

pub struct Nip42;

impl NipModule for Nip42 {
    fn name(&self) -> &'static str {
        "nip42"
    }

    fn nips(&self) -> &'static [u16] {
        &[42]
    }

    fn policies(&self) -> &'static [Policy] {
        &[shadow_auth_events, require_auth_for_writes]
    }
}

/// Auth events published through the EVENT verb are acknowledged but
/// never stored or broadcast; verification happens on the AUTH verb.
fn shadow_auth_events(event: &Event, _snap: &ConnectionSnapshot, _cfg: &RelayConfig) -> Verdict {
    if event.kind == KIND_CLIENT_AUTH {
        Verdict::Shadow("auth event consumed".to_string())
    } else {
        Verdict::Accept
    }
}

fn require_auth_for_writes(
    _event: &Event,
    snap: &ConnectionSnapshot,
    cfg: &RelayConfig,
) -> Verdict {
    if cfg.auth_required && snap.auth_pubkey.is_none() {
        Verdict::Reject("auth-required: authenticate before publishing".to_string())
    } else {
        Verdict::Accept
    }
}

/// Verify an AUTH response against the challenge this connection was
/// issued. Returns the authenticated pubkey.
pub fn verify_auth(
    event: &Event,
    expected_challenge: &str,
    cfg: &RelayConfig,
    now: u64,
) -> Result<String, String> {
    if event.kind != KIND_CLIENT_AUTH {
        return Err("invalid: auth event must be kind 22242".to_string());
    }
    if let Err(reason) = event.validate_shape() {
        return Err(format!("invalid: {reason}"));
    }
    if !event.verify_id() || !event.verify_signature() {
        return Err("invalid: bad auth event signature".to_string());
    }

    let age = now.abs_diff(event.created_at);
    if age > cfg.max_auth_age_seconds {
        return Err("invalid: auth event timestamp out of range".to_string());
    }

    let challenge_ok = event
        .tag_values("challenge")
        .any(|c| c == expected_challenge);
    if !challenge_ok {
        return Err("invalid: challenge mismatch".to_string());
    }

    let relay_ok = event.tag_values("relay").any(|claimed| {
        let Some(claimed_host) = host_of(claimed) else {
            return false;
        };
        cfg.urls
            .iter()
            .any(|own| host_of(own).as_deref() == Some(claimed_host.as_str()))
    });
    if !relay_ok {
        return Err("invalid: relay url does not match this relay".to_string());
    }

    Ok(event.pubkey.clone())
}

fn host_of(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}
