//! Shared harness for the integration suites: key generation, event
//! signing, and an in-process connection that drives the dispatcher
//! without a network socket.

#![allow(dead_code)]

use std::sync::Arc;

use axum::extract::ws::Message;
use rand::RngCore;
use secp256k1::{Keypair, Message as SecpMessage, Secp256k1, SecretKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Notify};

use rostrum::config::RelayConfig;
use rostrum::connection::ConnectionContext;
use rostrum::event::Event;
use rostrum::server::{build_state, handle_text, AppState};

pub fn keypair() -> Keypair {
    let secp = Secp256k1::new();
    let mut bytes = [0u8; 32];
    loop {
        rand::thread_rng().fill_bytes(&mut bytes);
        if let Ok(sk) = SecretKey::from_slice(&bytes) {
            return Keypair::from_secret_key(&secp, &sk);
        }
    }
}

pub fn pubkey_hex(kp: &Keypair) -> String {
    hex::encode(kp.x_only_public_key().0.serialize())
}

pub fn sign_event(
    kp: &Keypair,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: &str,
    created_at: u64,
) -> Event {
    let secp = Secp256k1::new();
    let mut event = Event {
        id: String::new(),
        pubkey: pubkey_hex(kp),
        created_at,
        kind,
        tags,
        content: content.to_string(),
        sig: String::new(),
    };
    event.id = event.compute_id();
    let digest: [u8; 32] = Sha256::digest(event.canonical_serialization().as_bytes()).into();
    let sig = secp.sign_schnorr_no_aux_rand(&SecpMessage::from_digest(digest), kp);
    event.sig = hex::encode(sig.serialize());
    event
}

pub struct Harness {
    pub state: Arc<AppState>,
}

pub struct Conn {
    pub ctx: ConnectionContext,
    pub tx: mpsc::Sender<Message>,
    pub rx: mpsc::Receiver<Message>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(RelayConfig::default()).await
    }

    pub async fn with_config(cfg: RelayConfig) -> Self {
        let state = build_state(cfg).await.expect("in-memory relay state");
        Self { state }
    }

    /// A connection as the server would set one up, minus the socket.
    pub async fn connect(&self) -> Conn {
        let ctx = ConnectionContext::new(&self.state.cfg, "127.0.0.1:9".to_string());
        let (tx, rx) = mpsc::channel(self.state.cfg.outbound_queue_size);
        self.state
            .subs
            .register(&ctx.conn_id, tx.clone(), Arc::new(Notify::new()))
            .await;
        Conn { ctx, tx, rx }
    }

    /// Feed one raw frame through the dispatcher.
    pub async fn send(&self, conn: &mut Conn, frame: &str) {
        handle_text(frame, &mut conn.ctx, &self.state, &conn.tx).await;
    }

    pub async fn publish(&self, conn: &mut Conn, event: &Event) -> Value {
        let frame = serde_json::json!(["EVENT", event]).to_string();
        self.send(conn, &frame).await;
        conn.expect_frame()
    }
}

impl Conn {
    /// Next outbound frame; panics if none is queued. Dispatch completes
    /// before this is called, so anything owed has already been enqueued.
    pub fn expect_frame(&mut self) -> Value {
        let msg = self.rx.try_recv().expect("expected an outbound frame");
        match msg {
            Message::Text(text) => serde_json::from_str(&text).expect("frame is json"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    pub fn maybe_frame(&mut self) -> Option<Value> {
        match self.rx.try_recv() {
            Ok(Message::Text(text)) => Some(serde_json::from_str(&text).expect("frame is json")),
            Ok(other) => panic!("expected text frame, got {other:?}"),
            Err(_) => None,
        }
    }

    /// Frames up to and including the next EOSE for `sub_id`; returns the
    /// EVENT payloads.
    pub fn drain_until_eose(&mut self, sub_id: &str) -> Vec<Value> {
        let mut events = Vec::new();
        loop {
            let frame = self.expect_frame();
            match frame[0].as_str() {
                Some("EVENT") => {
                    assert_eq!(frame[1].as_str(), Some(sub_id));
                    events.push(frame[2].clone());
                }
                Some("EOSE") => {
                    assert_eq!(frame[1].as_str(), Some(sub_id));
                    return events;
                }
                other => panic!("unexpected frame before EOSE: {other:?}"),
            }
        }
    }
}

/// `["OK", id, accepted, message]` destructured.
pub fn ok_parts(frame: &Value) -> (String, bool, String) {
    assert_eq!(frame[0].as_str(), Some("OK"));
    (
        frame[1].as_str().expect("event id").to_string(),
        frame[2].as_bool().expect("accepted flag"),
        frame[3].as_str().unwrap_or("").to_string(),
    )
}
