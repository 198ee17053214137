//! # Address classification and mode selection
//!
//! Decides how a watch is implemented before anything touches the target.
//!
//! ## Rules
//!
//! An address is **static** when it lies inside a loaded image and **dynamic**
//! otherwise. The detection mode is then chosen in this order:
//!
//! 1. Write-only watches use a hardware breakpoint (guard pages fire on any access).
//! 2. Dynamic addresses use a hardware breakpoint (heap pages are shared with
//!    unrelated allocations, so guarding them floods the agent).
//! 3. Everything else uses a page guard.
//!
//! Both functions are pure. [`classify_in`] is the only place that talks to
//! the target, and it falls back to static when the module list is
//! unavailable, which keeps the watch on the page-guard path that does not
//! consume a debug register slot.

use tracing::{debug, warn};

use crate::target::ProcessAccess;
use crate::types::{AccessMode, Address, AddressClass, DetectionMode, ModuleInfo};

/// Classify `address` against a module list.
#[must_use]
pub fn classify(address: Address, modules: &[ModuleInfo]) -> AddressClass
{
    if modules.iter().any(|module| module.contains(address)) {
        AddressClass::Static
    } else {
        AddressClass::Dynamic
    }
}

/// Classify `address` using the target's current module list
///
/// The list is refreshed first so modules loaded after the backend was opened
/// are seen.
pub fn classify_in<T: ProcessAccess + ?Sized>(target: &T, address: Address) -> AddressClass
{
    match target.enumerate_modules(true) {
        Ok(modules) => {
            let class = classify(address, &modules);
            debug!("{address} classified as {class} against {} modules", modules.len());
            class
        }
        Err(e) => {
            warn!("Module list unavailable ({e}); treating {address} as static");
            AddressClass::Static
        }
    }
}

/// Choose the detection mode for a classified address.
#[must_use]
pub const fn select_mode(class: AddressClass, access: AccessMode) -> DetectionMode
{
    match (access, class) {
        (AccessMode::WriteOnly, _) | (_, AddressClass::Dynamic) => DetectionMode::HardwareBreakpoint,
        (AccessMode::ReadWrite, AddressClass::Static) => DetectionMode::PageGuard,
    }
}
