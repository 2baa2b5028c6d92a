//! Core event admission: schema, hash, signature, size limits, timestamp
//! drift, and the allow/block lists. Also claims NIP-50 since the filter
//! matcher implements `search`.

use crate::config::RelayConfig;
use crate::event::Event;
use crate::policy::{ConnectionSnapshot, NipModule, Policy, Verdict};
use crate::util::unix_now;

pub struct Nip01;

impl NipModule for Nip01 {
    fn name(&self) -> &'static str {
        "nip01"
    }

    fn nips(&self) -> &'static [u16] {
        &[1, 50]
    }

    fn policies(&self) -> &'static [Policy] {
        &[
            check_shape,
            check_id,
            check_signature,
            check_limits,
            check_timestamp_drift,
            check_allow_block,
        ]
    }
}

fn check_shape(event: &Event, _snap: &ConnectionSnapshot, _cfg: &RelayConfig) -> Verdict {
    match event.validate_shape() {
        Ok(()) => Verdict::Accept,
        Err(reason) => Verdict::Reject(format!("invalid: {reason}")),
    }
}

fn check_id(event: &Event, _snap: &ConnectionSnapshot, _cfg: &RelayConfig) -> Verdict {
    if event.verify_id() {
        Verdict::Accept
    } else {
        Verdict::Reject("invalid: id does not match event hash".to_string())
    }
}

fn check_signature(event: &Event, _snap: &ConnectionSnapshot, _cfg: &RelayConfig) -> Verdict {
    if event.verify_signature() {
        Verdict::Accept
    } else {
        Verdict::Reject("invalid: bad signature".to_string())
    }
}

fn check_limits(event: &Event, _snap: &ConnectionSnapshot, cfg: &RelayConfig) -> Verdict {
    if event.content.len() > cfg.max_content_length {
        return Verdict::Reject(format!(
            "invalid: content too long (max {} bytes)",
            cfg.max_content_length
        ));
    }
    if event.tags.len() > cfg.max_event_tags {
        return Verdict::Reject(format!(
            "invalid: too many tags (max {})",
            cfg.max_event_tags
        ));
    }
    let oversized = event
        .tags
        .iter()
        .flatten()
        .any(|value| value.len() > cfg.max_tag_value_length);
    if oversized {
        return Verdict::Reject(format!(
            "invalid: tag value too long (max {} bytes)",
            cfg.max_tag_value_length
        ));
    }
    Verdict::Accept
}

fn check_timestamp_drift(event: &Event, _snap: &ConnectionSnapshot, cfg: &RelayConfig) -> Verdict {
    let now = unix_now();
    if event.created_at > now.saturating_add(cfg.max_future_seconds) {
        return Verdict::Reject("invalid: created_at too far in the future".to_string());
    }
    if let Some(max_past) = cfg.max_past_seconds {
        if event.created_at < now.saturating_sub(max_past) {
            return Verdict::Reject("invalid: created_at too far in the past".to_string());
        }
    }
    Verdict::Accept
}

fn check_allow_block(event: &Event, _snap: &ConnectionSnapshot, cfg: &RelayConfig) -> Verdict {
    if cfg.blocked_pubkeys.contains(&event.pubkey) {
        return Verdict::Reject("blocked: pubkey is banned".to_string());
    }
    if let Some(allowed) = &cfg.allowed_pubkeys {
        if !allowed.contains(&event.pubkey) {
            return Verdict::Reject("restricted: pubkey not on the allow list".to_string());
        }
    }
    if cfg.blocked_kinds.contains(&event.kind) {
        return Verdict::Reject("blocked: kind not accepted here".to_string());
    }
    if let Some(allowed) = &cfg.allowed_kinds {
        if !allowed.contains(&event.kind) {
            return Verdict::Reject("restricted: kind not on the allow list".to_string());
        }
    }
    Verdict::Accept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{keypair, pubkey_hex, sign_event};

    fn snap() -> ConnectionSnapshot {
        ConnectionSnapshot::default()
    }

    #[test]
    fn valid_event_passes_all() {
        let event = sign_event(&keypair(), 1, vec![], "hello", unix_now());
        let cfg = RelayConfig::default();
        let module = Nip01;
        for policy in module.policies() {
            assert_eq!(policy(&event, &snap(), &cfg), Verdict::Accept);
        }
    }

    #[test]
    fn tampered_event_is_rejected() {
        let mut event = sign_event(&keypair(), 1, vec![], "hello", unix_now());
        event.content = "evil".into();
        assert!(matches!(
            check_id(&event, &snap(), &RelayConfig::default()),
            Verdict::Reject(_)
        ));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.max_content_length = 4;
        let event = sign_event(&keypair(), 1, vec![], "longer than four", unix_now());
        assert!(matches!(
            check_limits(&event, &snap(), &cfg),
            Verdict::Reject(_)
        ));
    }

    #[test]
    fn future_drift_is_rejected() {
        let cfg = RelayConfig::default();
        let event = sign_event(
            &keypair(),
            1,
            vec![],
            "from the future",
            unix_now() + cfg.max_future_seconds + 60,
        );
        let verdict = check_timestamp_drift(&event, &snap(), &cfg);
        assert!(matches!(verdict, Verdict::Reject(ref r) if r.starts_with("invalid:")));
    }

    #[test]
    fn block_list_beats_allow_list() {
        let kp = keypair();
        let pk = pubkey_hex(&kp);
        let mut cfg = RelayConfig::default();
        cfg.allowed_pubkeys = Some([pk.clone()].into_iter().collect());
        cfg.blocked_pubkeys = [pk].into_iter().collect();
        let event = sign_event(&kp, 1, vec![], "x", unix_now());
        assert!(matches!(
            check_allow_block(&event, &snap(), &cfg),
            Verdict::Reject(ref r) if r.starts_with("blocked:")
        ));
    }

    #[test]
    fn kind_allow_list_restricts() {
        let mut cfg = RelayConfig::default();
        cfg.allowed_kinds = Some([1u16].into_iter().collect());
        let note = sign_event(&keypair(), 1, vec![], "x", unix_now());
        let other = sign_event(&keypair(), 7, vec![], "x", unix_now());
        assert_eq!(check_allow_block(&note, &snap(), &cfg), Verdict::Accept);
        assert!(matches!(
            check_allow_block(&other, &snap(), &cfg),
            Verdict::Reject(_)
        ));
    }
}
