//! NIP-70 protected events: a bare `["-"]` tag means only the author,
//! authenticated over NIP-42, may publish the event here.

use crate::config::RelayConfig;
use crate::event::Event;
use crate::policy::{ConnectionSnapshot, NipModule, Policy, Verdict};

pub struct Nip70;

impl NipModule for Nip70 {
    fn name(&self) -> &'static str {
        "nip70"
    }

    fn nips(&self) -> &'static [u16] {
        &[70]
    }

    fn policies(&self) -> &'static [Policy] {
        &[check_protected]
    }
}

fn check_protected(event: &Event, snap: &ConnectionSnapshot, _cfg: &RelayConfig) -> Verdict {
    if !event.is_protected() {
        return Verdict::Accept;
    }
    match &snap.auth_pubkey {
        Some(auth_pk) if *auth_pk == event.pubkey => Verdict::Accept,
        _ => Verdict::Reject("auth-required: protected event".to_string()),
    }
}
