//! Key generation and event signing helpers for the test suites. The relay
//! itself only ever verifies; signing lives here.

use rand::RngCore;
use secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::event::Event;

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

/// Build a fully signed event the relay will accept.
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
    debug_assert_eq!(hex::encode(digest), event.id);
    let msg = Message::from_digest(digest);
    let sig = secp.sign_schnorr_no_aux_rand(&msg, kp);
    event.sig = hex::encode(sig.serialize());
    event
}
