//! NIP-40 expiration: events whose `expiration` tag is already in the
//! past are refused at the door. Stored events are filtered out of query
//! results by the store once they lapse.

use crate::config::RelayConfig;
use crate::event::Event;
use crate::policy::{ConnectionSnapshot, NipModule, Policy, Verdict};
use crate::util::unix_now;

pub struct Nip40;

impl NipModule for Nip40 {
    fn name(&self) -> &'static str {
        "nip40"
    }

    fn nips(&self) -> &'static [u16] {
        &[40]
    }

    fn policies(&self) -> &'static [Policy] {
        &[check_expiration]
    }
}

fn check_expiration(event: &Event, _snap: &ConnectionSnapshot, _cfg: &RelayConfig) -> Verdict {
    match event.expiration() {
        Some(expires_at) if expires_at <= unix_now() => {
            Verdict::Reject("invalid: event expired".to_string())
        }
        _ => Verdict::Accept,
    }
}
