//! NIP-77 set reconciliation. The session machinery and IdList codec
//! live in [`crate::negentropy`]; this module declares the capability.

use crate::policy::NipModule;

pub struct Nip77;

impl NipModule for Nip77 {
    fn name(&self) -> &'static str {
        "nip77"
    }

    fn nips(&self) -> &'static [u16] {
        &[77]
    }
}
