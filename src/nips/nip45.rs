//! NIP-45 event counts. The COUNT verb is dispatched straight to the
//! store; this module declares the capability.

use crate::policy::NipModule;

pub struct Nip45;

impl NipModule for Nip45 {
    fn name(&self) -> &'static str {
        "nip45"
    }

    fn nips(&self) -> &'static [u16] {
        &[45]
    }
}
