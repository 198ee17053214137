//! # Target process interfaces
//!
//! The watchpoint logic never calls the OS directly. It drives a target
//! through two traits, which the Windows backend implements with Win32 calls
//! and the test suite implements with an in-memory simulation.
//!
//! - [`ProcessAccess`]: memory, module list, remote threads, library loading.
//! - [`ThreadControl`]: thread enumeration, suspension and debug-register
//!   context access.
//!
//! Every operation returns a [`Result`]; there are no null or boolean
//! sentinels at this boundary.

use std::path::Path;
use std::time::Duration;

use crate::debug_registers::DebugContext;
use crate::error::Result;
use crate::types::{Address, Bitness, ModuleInfo, ProcessId, Protection, RegionInfo, ThreadId};

/// How a remote thread finished waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadExit
{
    /// The thread returned; the value is its exit code
    Exited(u32),
    /// The timeout elapsed first; the thread may still be running
    TimedOut,
}

/// A thread started in the target by [`ProcessAccess::start_remote_thread`]
pub trait RemoteThread: Send
{
    /// Thread ID in the target
    fn id(&self) -> ThreadId;

    /// Wait up to `timeout` for the thread to exit.
    fn join(&mut self, timeout: Duration) -> Result<ThreadExit>;
}

/// Memory and module access to a target process
pub trait ProcessAccess: Send + Sync
{
    /// Target process ID
    fn pid(&self) -> ProcessId;

    /// Pointer width of the target
    fn bitness(&self) -> Bitness;

    /// Read exactly `size` bytes at `address`.
    fn read(&self, address: Address, size: usize) -> Result<Vec<u8>>;

    /// Write all of `bytes` at `address`.
    fn write(&self, address: Address, bytes: &[u8]) -> Result<()>;

    /// Commit `size` bytes of fresh memory with `protection`.
    fn allocate(&self, size: usize, protection: Protection) -> Result<Address>;

    /// Release an allocation made by [`ProcessAccess::allocate`].
    fn free(&self, address: Address) -> Result<()>;

    /// Change protection of `[address, address + size)`, returning the old protection.
    fn protect(&self, address: Address, size: usize, protection: Protection) -> Result<Protection>;

    /// Describe the committed region containing `address`.
    fn query_region(&self, address: Address) -> Result<RegionInfo>;

    /// Start a thread at `entry` with a single pointer-sized argument.
    fn start_remote_thread(&self, entry: Address, argument: u64) -> Result<Box<dyn RemoteThread>>;

    /// Loaded modules; `force_refresh` bypasses any cached list.
    fn enumerate_modules(&self, force_refresh: bool) -> Result<Vec<ModuleInfo>>;

    /// Load the library at `path` into the target and return its base.
    fn load_module_into_target(&self, path: &Path) -> Result<Address>;

    /// Page size of the target.
    fn page_size(&self) -> u64
    {
        0x1000
    }
}

/// A suspended thread
///
/// `raw` is the backend's handle (an OS `HANDLE` on Windows, unused by the
/// simulation). The value is deliberately not `Clone`: each suspension must be
/// matched by exactly one [`ThreadControl::resume_thread`].
#[derive(Debug, PartialEq, Eq)]
pub struct ThreadHandle
{
    /// Thread ID
    pub id: ThreadId,
    /// Backend handle
    pub raw: usize,
}

/// Thread enumeration, suspension and debug-register access
pub trait ThreadControl: Send + Sync
{
    /// IDs of the target's threads at this moment
    ///
    /// Backends running inside the target (the agent) leave out the calling
    /// thread.
    fn thread_ids(&self) -> Result<Vec<ThreadId>>;

    /// Open and suspend a thread.
    fn suspend_thread(&self, thread: ThreadId) -> Result<ThreadHandle>;

    /// Resume and close a thread suspended by [`ThreadControl::suspend_thread`].
    fn resume_thread(&self, handle: ThreadHandle) -> Result<()>;

    /// Read debug registers and flags of a suspended thread.
    fn read_debug_context(&self, handle: &ThreadHandle) -> Result<DebugContext>;

    /// Write debug registers and flags of a suspended thread.
    fn write_debug_context(&self, handle: &ThreadHandle, context: &DebugContext) -> Result<()>;
}

/// Everything a watchpoint session needs from a target.
pub trait TargetProcess: ProcessAccess + ThreadControl {}

impl<T: ProcessAccess + ThreadControl> TargetProcess for T {}
