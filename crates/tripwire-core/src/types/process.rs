//! Process, thread, module and memory region types.

use std::fmt;

use super::Address;

/// Process identifier (PID)
///
/// Windows process IDs are 32-bit values. The newtype keeps them from being
/// confused with thread IDs, which share the same numeric space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// This is the OS thread ID, not a handle. Handles are opened on demand by the
/// backend and are never stored in this type. Hit records carry the ID the
/// agent read inside the target (`GetCurrentThreadId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId
{
    /// Get the raw identifier
    #[must_use]
    pub fn raw(&self) -> u32
    {
        self.0
    }
}

impl From<u32> for ThreadId
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Pointer width of the target process
///
/// A 64-bit controller can drive a 32-bit (WOW64) target; the calling
/// convention of remote stubs and the layout of thread contexts follow the
/// target, not the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness
{
    /// 32-bit x86 target
    X86,
    /// 64-bit x86-64 target
    X64,
}

impl Bitness
{
    /// Size of a pointer in bytes.
    #[must_use]
    pub const fn pointer_size(self) -> usize
    {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }
}

impl fmt::Display for Bitness
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::X86 => write!(f, "x86"),
            Self::X64 => write!(f, "x64"),
        }
    }
}

/// A loaded executable image in the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo
{
    /// Module file name (e.g. `game.exe`, `kernel32.dll`)
    pub name: String,
    /// Image base
    pub base: Address,
    /// Size of the mapped image in bytes
    pub size: u64,
}

impl ModuleInfo
{
    /// Create a new module description
    #[must_use]
    pub fn new(name: impl Into<String>, base: Address, size: u64) -> Self
    {
        Self {
            name: name.into(),
            base,
            size,
        }
    }

    /// Whether `address` falls inside `[base, base + size)`.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address.value() - self.base.value() < self.size
    }
}

/// Windows page protection flags
///
/// Values are the raw `PAGE_*` constants so they can travel through the shared
/// channel (original protection field) and back into `VirtualProtectEx`
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protection(pub u32);

impl Protection
{
    /// `PAGE_NOACCESS`
    pub const NO_ACCESS: Self = Self(0x01);
    /// `PAGE_READONLY`
    pub const READ_ONLY: Self = Self(0x02);
    /// `PAGE_READWRITE`
    pub const READ_WRITE: Self = Self(0x04);
    /// `PAGE_WRITECOPY`
    pub const WRITE_COPY: Self = Self(0x08);
    /// `PAGE_EXECUTE`
    pub const EXECUTE: Self = Self(0x10);
    /// `PAGE_EXECUTE_READ`
    pub const EXECUTE_READ: Self = Self(0x20);
    /// `PAGE_EXECUTE_READWRITE`
    pub const EXECUTE_READ_WRITE: Self = Self(0x40);
    /// `PAGE_GUARD` modifier
    pub const GUARD: Self = Self(0x100);

    /// Raw flag value
    #[must_use]
    pub const fn bits(self) -> u32
    {
        self.0
    }

    /// Whether the guard modifier is set.
    #[must_use]
    pub const fn is_guarded(self) -> bool
    {
        self.0 & Self::GUARD.0 != 0
    }

    /// Whether the page can be touched at all.
    #[must_use]
    pub const fn is_accessible(self) -> bool
    {
        self.0 != 0 && self.0 & Self::NO_ACCESS.0 == 0
    }

    /// The same protection with the guard modifier added.
    #[must_use]
    pub const fn with_guard(self) -> Self
    {
        Self(self.0 | Self::GUARD.0)
    }
}

impl fmt::Display for Protection
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

/// Committed memory region around a queried address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo
{
    /// Base of the region (page aligned)
    pub base: Address,
    /// Region size in bytes
    pub size: u64,
    /// Current protection
    pub protection: Protection,
    /// Whether the region is committed
    pub committed: bool,
}
