//! # tripwire-core
//!
//! Memory watchpoints for running Windows processes.
//!
//! A controller watches one location inside a separate target process and is
//! told about every access while the target keeps running. This crate
//! provides:
//! - Address classification and detection mode selection
//! - Debug register (DR0-DR3, DR7) programming across all target threads
//! - The shared channel the in-target agent reports hits through
//! - Agent bootstrap and remote calls into the target
//! - A crash-safe shutdown sequence
//!
//! ## Detection Modes
//!
//! - **Page guard**: the watched page gets `PAGE_GUARD`; the agent's exception
//!   handler records the fault, single-steps the access and re-arms the guard
//! - **Hardware breakpoint**: one of the four debug registers watches the
//!   address on every thread; the CPU raises a single-step exception on access
//!
//! ## Platform Support
//!
//! - **Windows (x86, x86-64)**: full backend in [`platform::win32`]
//! - **Everything else**: the portable core only; [`platform::open_process`]
//!   returns [`TripwireError::UnsupportedPlatform`]
//!
//! ## Why unsafe code is needed
//!
//! The shared channel is raw memory mapped into two processes, and the
//! Windows backend calls Win32 APIs that read and modify other processes'
//! memory and threads. Both are wrapped in safe abstractions here.

#![allow(unsafe_code)] // Required for the shared mapping and Win32 APIs

pub mod agent;
pub mod channel;
pub mod classify;
pub mod config;
pub mod debug_registers;
pub mod error;
pub mod events;
pub mod guards;
pub mod hardware;
pub mod platform;
pub mod poller;
pub mod remote;
pub mod session;
pub mod shutdown;
pub mod slots;
pub mod target;
pub mod types;

pub use config::SessionConfig;
pub use error::{ErrorKind, Result, TripwireError};
pub use events::{WatchEvent, WatchEventReceiver};
pub use session::{SessionState, WatchpointSession};
pub use shutdown::ShutdownReport;
pub use target::{ProcessAccess, TargetProcess, ThreadControl};
pub use types::{AccessMode, Address, DetectionMode, HitRecord, ProcessId, ThreadId, WatchpointConfig};
