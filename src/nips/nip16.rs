//! NIP-16/33 storage routing: kind ranges decide whether an event lands
//! as a regular row, replaces a `(pubkey, kind)` slot, replaces a
//! `(pubkey, kind, d-tag)` slot, or is never stored at all.

use crate::event::{Event, KindClass};
use crate::policy::{NipModule, StoreRoute};

pub struct Nip16;

impl NipModule for Nip16 {
    fn name(&self) -> &'static str {
        "nip16"
    }

    fn nips(&self) -> &'static [u16] {
        &[16, 33]
    }

    fn route(&self, event: &Event) -> Option<StoreRoute> {
        match event.kind_class() {
            KindClass::Regular => None,
            KindClass::Replaceable => Some(StoreRoute::Replaceable),
            KindClass::Ephemeral => Some(StoreRoute::Ephemeral),
            KindClass::Addressable => Some(StoreRoute::Addressable {
                d_tag: event.d_tag().to_string(),
            }),
        }
    }
}
