//! Watch configuration and hit types.

use std::fmt;
use std::time::SystemTime;

use super::{Address, ThreadId};
use crate::error::{Result, TripwireError};

/// Which accesses should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode
{
    /// Report writes only
    ///
    /// Guard pages cannot tell reads from writes without decoding the
    /// faulting instruction, so write-only watches always use a debug
    /// register.
    WriteOnly,
    /// Report reads and writes
    ReadWrite,
}

impl fmt::Display for AccessMode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::WriteOnly => write!(f, "write"),
            Self::ReadWrite => write!(f, "read/write"),
        }
    }
}

/// How accesses are detected. Derived from the address and access mode, never
/// chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionMode
{
    /// `PAGE_GUARD` on the page containing the address, re-armed by the agent
    PageGuard,
    /// One of the DR0-DR3 debug registers
    HardwareBreakpoint,
}

impl fmt::Display for DetectionMode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::PageGuard => write!(f, "page guard"),
            Self::HardwareBreakpoint => write!(f, "hardware breakpoint"),
        }
    }
}

/// Whether an address lies inside a loaded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressClass
{
    /// Inside a loaded module's image range
    Static,
    /// Heap, stack or any other private allocation
    Dynamic,
}

impl fmt::Display for AddressClass
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Static => write!(f, "static"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// A single watch request
///
/// Construct through [`WatchpointConfig::new`], which rejects sizes the debug
/// registers cannot express. The value is copied into the session when
/// monitoring starts and is never changed afterwards.
///
/// ## Example
///
/// ```rust
/// use tripwire_core::types::{AccessMode, Address, WatchpointConfig};
///
/// let config = WatchpointConfig::new(Address::new(0x0040_0010), 4, AccessMode::ReadWrite)?;
/// assert_eq!(config.size(), 4);
/// assert!(WatchpointConfig::new(Address::new(0x1000), 3, AccessMode::ReadWrite).is_err());
/// # Ok::<(), tripwire_core::error::TripwireError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchpointConfig
{
    address: Address,
    size: u32,
    access: AccessMode,
}

impl WatchpointConfig
{
    /// Create a watch request
    ///
    /// ## Errors
    ///
    /// - `InvalidSize`: `size` is not 1, 2, 4 or 8
    pub fn new(address: Address, size: u32, access: AccessMode) -> Result<Self>
    {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(TripwireError::InvalidSize(size));
        }
        Ok(Self { address, size, access })
    }

    /// Watched address
    #[must_use]
    pub const fn address(&self) -> Address
    {
        self.address
    }

    /// Watched length in bytes
    #[must_use]
    pub const fn size(&self) -> u32
    {
        self.size
    }

    /// Which accesses are reported
    #[must_use]
    pub const fn access(&self) -> AccessMode
    {
        self.access
    }

    /// Whether `address` falls in the watched range.
    #[must_use]
    pub fn covers(&self, address: Address) -> bool
    {
        address >= self.address && address.value() - self.address.value() < u64::from(self.size)
    }
}

impl fmt::Display for WatchpointConfig
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} ({} bytes, {})", self.address, self.size, self.access)
    }
}

/// One reported access
///
/// Created by the agent inside the target, drained by the poller, and handed
/// to subscribers. `sequence` counts records in drain order for the lifetime
/// of a session; a gap means the ring overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitRecord
{
    /// Address the agent attributed the access to
    pub address: Address,
    /// Target thread that performed the access
    pub thread_id: ThreadId,
    /// Position of this record in the session's hit stream
    pub sequence: u64,
    /// When the controller drained the record
    pub received_at: SystemTime,
}
