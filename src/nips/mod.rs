//! Built-in per-NIP modules. Each is a value implementing
//! [`crate::policy::NipModule`]; the boot-time list below is the registry.

pub mod nip01;
pub mod nip09;
pub mod nip11;
pub mod nip16;
pub mod nip40;
pub mod nip42;
pub mod nip45;
pub mod nip70;
pub mod nip77;

use crate::policy::NipModule;

/// Registration order is pipeline order: validation first, then the
/// storage-affecting modules, then the surfaces.
pub fn builtin_modules() -> Vec<Box<dyn NipModule>> {
    vec![
        Box::new(nip01::Nip01),
        Box::new(nip09::Nip09),
        Box::new(nip11::Nip11),
        Box::new(nip16::Nip16),
        Box::new(nip40::Nip40),
        Box::new(nip42::Nip42),
        Box::new(nip45::Nip45),
        Box::new(nip70::Nip70),
        Box::new(nip77::Nip77),
    ]
}
