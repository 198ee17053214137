//! # Platform Backends
//!
//! Implementations of [`ProcessAccess`](crate::target::ProcessAccess),
//! [`ThreadControl`](crate::target::ThreadControl) and
//! [`RegionFactory`](crate::channel::RegionFactory) for real processes.
//!
//! - **Windows (x86, x86-64)**: `OpenProcess`, `Get/SetThreadContext` (and the
//!   `Wow64` variants for 32-bit targets), `CreateRemoteThread` and named
//!   file mappings.
//!   - See: [Debugging Functions](https://learn.microsoft.com/en-us/windows/win32/debug/debugging-functions)
//!
//! Everything else builds the portable core only; the constructors here
//! return [`TripwireError::UnsupportedPlatform`](crate::TripwireError::UnsupportedPlatform).

use std::sync::Arc;

use crate::channel::RegionFactory;
#[cfg(not(all(windows, any(target_arch = "x86_64", target_arch = "x86"))))]
use crate::error::TripwireError;
use crate::error::Result;
use crate::target::TargetProcess;
use crate::types::ProcessId;

#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "x86")))]
pub mod win32;

/// Open `pid` for watching
///
/// ## Errors
///
/// - `UnsupportedPlatform` off Windows
/// - Access denied or no such process
#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "x86")))]
pub fn open_process(pid: ProcessId) -> Result<Arc<dyn TargetProcess>>
{
    Ok(Arc::new(win32::WindowsProcess::open(pid)?))
}

/// Open `pid` for watching
///
/// ## Errors
///
/// Always `UnsupportedPlatform` on this host.
#[cfg(not(all(windows, any(target_arch = "x86_64", target_arch = "x86"))))]
pub fn open_process(_pid: ProcessId) -> Result<Arc<dyn TargetProcess>>
{
    Err(TripwireError::UnsupportedPlatform)
}

/// Factory for the shared channel's named mapping
///
/// ## Errors
///
/// `UnsupportedPlatform` off Windows.
#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "x86")))]
pub fn region_factory() -> Result<Arc<dyn RegionFactory>>
{
    Ok(Arc::new(win32::WindowsRegionFactory))
}

/// Factory for the shared channel's named mapping
///
/// ## Errors
///
/// Always `UnsupportedPlatform` on this host.
#[cfg(not(all(windows, any(target_arch = "x86_64", target_arch = "x86"))))]
pub fn region_factory() -> Result<Arc<dyn RegionFactory>>
{
    Err(TripwireError::UnsupportedPlatform)
}
