//! NIP-77 set reconciliation. The exchange is an IdList diff: the client
//! sends the ids it owns under a filter, the relay answers with the ids it
//! has that the client is missing. One more round with the merged set
//! yields an empty diff and the client closes the session.
//!
//! Codec: a 4-byte big-endian count followed by that many 32-byte ids,
//! the whole payload hex-encoded. Ids are sorted ascending so encoding is
//! deterministic; `encode_id_list` and `decode_id_list` are inverses.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

pub fn encode_id_list(ids: &BTreeSet<[u8; 32]>) -> String {
    let mut bytes = Vec::with_capacity(4 + ids.len() * 32);
    bytes.extend_from_slice(&(ids.len() as u32).to_be_bytes());
    for id in ids {
        bytes.extend_from_slice(id);
    }
    hex::encode(bytes)
}

pub fn decode_id_list(msg_hex: &str) -> Result<BTreeSet<[u8; 32]>, String> {
    let bytes = hex::decode(msg_hex).map_err(|e| format!("invalid hex: {e}"))?;
    if bytes.len() < 4 {
        return Err("truncated payload: missing count".to_string());
    }
    let count = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() != count * 32 {
        return Err(format!(
            "length mismatch: count {count} but {} id bytes",
            body.len()
        ));
    }
    let mut ids = BTreeSet::new();
    for chunk in body.chunks_exact(32) {
        let mut id = [0u8; 32];
        id.copy_from_slice(chunk);
        ids.insert(id);
    }
    Ok(ids)
}

struct NegSession {
    /// Snapshot of the relay-side id set taken at NEG-OPEN; the diff is
    /// computed against this for the life of the session.
    relay_ids: BTreeSet<[u8; 32]>,
    deadline: Instant,
}

/// Per-connection reconciliation sessions, bounded in number and age.
pub struct NegSessions {
    max_sessions: usize,
    timeout: Duration,
    sessions: HashMap<String, NegSession>,
}

impl NegSessions {
    pub fn new(max_sessions: usize, timeout: Duration) -> Self {
        Self {
            max_sessions,
            timeout,
            sessions: HashMap::new(),
        }
    }

    /// Open a session and compute the first diff. At most one session per
    /// id: re-opening replaces the previous exchange.
    pub fn open(
        &mut self,
        sub_id: &str,
        relay_ids: BTreeSet<[u8; 32]>,
        client_ids: &BTreeSet<[u8; 32]>,
    ) -> Result<BTreeSet<[u8; 32]>, String> {
        if self.sessions.len() >= self.max_sessions && !self.sessions.contains_key(sub_id) {
            return Err(format!(
                "blocked: too many concurrent sessions (max {})",
                self.max_sessions
            ));
        }
        let needs = relay_ids.difference(client_ids).copied().collect();
        self.sessions.insert(
            sub_id.to_string(),
            NegSession {
                relay_ids,
                deadline: Instant::now() + self.timeout,
            },
        );
        Ok(needs)
    }

    /// Continue an exchange: the remaining diff against the session's
    /// snapshot. Each round pushes the deadline out again.
    pub fn reconcile(
        &mut self,
        sub_id: &str,
        client_ids: &BTreeSet<[u8; 32]>,
    ) -> Result<BTreeSet<[u8; 32]>, String> {
        let session = self
            .sessions
            .get_mut(sub_id)
            .ok_or_else(|| "closed: unknown session".to_string())?;
        session.deadline = Instant::now() + self.timeout;
        Ok(session.relay_ids.difference(client_ids).copied().collect())
    }

    pub fn close(&mut self, sub_id: &str) -> bool {
        self.sessions.remove(sub_id).is_some()
    }

    /// Drop sessions past their deadline, returning their ids so the
    /// caller can emit `NEG-ERR` frames.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
