//! Per-connection state. One of these lives inside each WebSocket task;
//! the rest of the relay only ever sees the [`ConnectionSnapshot`].

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;

use crate::config::RelayConfig;
use crate::negentropy::NegSessions;
use crate::policy::ConnectionSnapshot;
use crate::util::unix_now;

const HEX_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

pub struct ConnectionContext {
    pub conn_id: String,
    pub remote_addr: String,
    pub connected_at: u64,
    /// NIP-42 challenge issued to this connection at upgrade time.
    pub challenge: String,
    pub auth_pubkey: Option<String>,
    pub sessions: NegSessions,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl ConnectionContext {
    pub fn new(cfg: &RelayConfig, remote_addr: String) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(cfg.max_messages_per_second).unwrap_or(nonzero!(50u32)),
        );
        Self {
            conn_id: nanoid::nanoid!(),
            remote_addr,
            connected_at: unix_now(),
            challenge: nanoid::nanoid!(32, &HEX_ALPHABET),
            auth_pubkey: None,
            sessions: NegSessions::new(
                cfg.neg_max_sessions_per_connection,
                Duration::from_millis(cfg.neg_session_timeout_ms),
            ),
            limiter: RateLimiter::direct(quota),
        }
    }

    /// False once the inbound frame quota is exhausted for this second.
    pub fn within_rate(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            conn_id: self.conn_id.clone(),
            remote_addr: self.remote_addr.clone(),
            auth_pubkey: self.auth_pubkey.clone(),
        }
    }
}
