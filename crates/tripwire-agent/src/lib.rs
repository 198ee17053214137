//! # Tripwire Agent
//!
//! Library loaded into the watched process. The controller calls its exports
//! through remote threads; from then on a vectored exception handler inside
//! the target records accesses into the shared channel.
//!
//! ## Exports
//!
//! | Export | Signature | Result |
//! |---|---|---|
//! | `init` | `(const wchar_t *channel)` | 1 on success |
//! | `uninit` | `()` | 1 |
//! | `installBreakpoint` | `(u32 slot, u64 address, u32 type, u32 size)` | 1 on success |
//! | `clearBreakpoint` | `(u32 slot)` | 1 on success |
//! | `refresh` | `()` | 1 on success |
//!
//! All exports use the `system` calling convention (`stdcall` on x86).
//!
//! The decision logic lives in [`watcher`] and builds on every platform; the
//! handler and exports only exist on Windows.

#![allow(unsafe_code)]

pub mod watcher;

#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "x86")))]
mod exports;
#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "x86")))]
mod veh;

#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "x86")))]
pub use exports::{clearBreakpoint, init, installBreakpoint, refresh, uninit};
pub use watcher::{Action, Fault, Rearm, Watcher};
