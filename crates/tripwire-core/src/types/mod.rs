//! # Types
//!
//! Platform-agnostic types shared by the controller, the backends and the
//! in-target agent.

pub mod address;
pub mod process;
pub mod watch;

// Re-export all public types
pub use address::Address;
pub use process::{Bitness, ModuleInfo, ProcessId, Protection, RegionInfo, ThreadId};
pub use watch::{AccessMode, AddressClass, DetectionMode, HitRecord, WatchpointConfig};
