//! # Error Types
//!
//! Error handling for watchpoint sessions.
//!
//! We use `thiserror` to generate the `Error` trait implementations. Every
//! variant also maps onto an [`ErrorKind`], which is the coarse category the
//! session uses to decide whether a failure aborts a start (configuration,
//! injection, protection, export resolution) or is only reported
//! (verification mismatch, shutdown timeout).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Address, ThreadId};

/// Coarse category of a [`TripwireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind
{
    /// The requested watch cannot be configured (bad size, no slot, busy session).
    Configuration,
    /// Loading or talking to the in-target agent failed.
    Injection,
    /// The watched page cannot be guarded.
    Protection,
    /// An export could not be found in the agent image.
    ExportResolution,
    /// Debug registers read back differently than written. Reported only.
    VerificationMismatch,
    /// In-flight exception handlers did not drain in time. Reported only.
    ShutdownTimeout,
    /// A primitive operation on the target process failed.
    Target,
    /// The host OS rejected a call.
    Platform,
    /// Local I/O failed.
    Io,
}

/// Main error type for watchpoint operations
///
/// ## Error Categories
///
/// 1. **Configuration**: NoFreeSlot, InvalidSize, Misaligned, AlreadyActive, InvalidSlot, InvalidArgument
/// 2. **Injection**: AgentMissing, AgentLoadFailed, AgentInitFailed, RemoteCallTimedOut, RemoteCallFailed
/// 3. **Protection**: PageNotAccessible, ProtectionChangeFailed
/// 4. **Export resolution**: ExportNotFound, InvalidImage
/// 5. **Advisory**: VerificationMismatch, ShutdownTimeout
/// 6. **Target**: ReadFailed, WriteFailed, AllocationFailed, ThreadFailed, HardwareBreakpointFailed,
///    ModuleEnumerationFailed, ChannelUnavailable
/// 7. **Platform**: UnsupportedPlatform, Windows (Windows-specific)
/// 8. **I/O errors**: Io
#[derive(Error, Debug)]
pub enum TripwireError
{
    /// All four hardware breakpoint slots are owned by other sessions
    ///
    /// x86 and x86-64 CPUs expose exactly four address registers (DR0-DR3).
    /// Stop another session or use an address that qualifies for page-guard
    /// detection.
    #[error("No free hardware breakpoint slot (all 4 in use)")]
    NoFreeSlot,

    /// Watch size is not one of 1, 2, 4 or 8 bytes.
    #[error("Invalid watch size: {0} (expected 1, 2, 4 or 8)")]
    InvalidSize(u32),

    /// Debug registers only match naturally aligned ranges.
    #[error("Address {address} is not aligned to the watch size {size}")]
    Misaligned
    {
        /// Watched address
        address: Address,
        /// Watch size in bytes
        size: u32,
    },

    /// A watch is already being configured or is active on this session
    ///
    /// Sessions hold one watch at a time. Start requests are never queued;
    /// stop the current watch first.
    #[error("Session already has a watch ({state})")]
    AlreadyActive
    {
        /// Session state at the time of the request
        state: String,
    },

    /// Slot index outside DR0-DR3.
    #[error("Invalid debug register slot: {0}")]
    InvalidSlot(u8),

    /// Invalid argument passed to a watchpoint function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The agent library does not exist on disk
    ///
    /// The agent has to be present before anything is done to the target.
    #[error("Agent library not found: {}", .0.display())]
    AgentMissing(PathBuf),

    /// The target refused to load the agent library
    ///
    /// This happens when:
    /// - The agent's bitness does not match the target
    /// - A dependency of the agent is missing in the target's search path
    /// - The target has exited
    #[error("Failed to load agent into target: {0}")]
    AgentLoadFailed(String),

    /// The agent's `init` export returned zero
    ///
    /// Usually the agent could not open the shared channel by name, for
    /// example because the controller and target run in different sessions
    /// and the channel lives in the `Local` namespace.
    #[error("Agent initialisation failed for channel {channel}")]
    AgentInitFailed
    {
        /// Name of the shared channel passed to `init`
        channel: String,
    },

    /// A remote call did not finish within the configured timeout
    ///
    /// The stub memory is left allocated in the target because the thread
    /// may still be executing it.
    #[error("Remote call to {function} timed out after {timeout:?}")]
    RemoteCallTimedOut
    {
        /// Address of the remote function
        function: Address,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A remote call could not be started or awaited.
    #[error("Remote call failed: {0}")]
    RemoteCallFailed(String),

    /// The watched page cannot be guarded
    ///
    /// Guard pages need a committed, accessible page. Pages that are
    /// `PAGE_NOACCESS` or already carry `PAGE_GUARD` are rejected.
    #[error("Page at {address} cannot be guarded: {reason}")]
    PageNotAccessible
    {
        /// Watched address
        address: Address,
        /// Why the page was rejected
        reason: String,
    },

    /// Changing a page's protection failed.
    #[error("Failed to change protection at {address}: {reason}")]
    ProtectionChangeFailed
    {
        /// Page base
        address: Address,
        /// Platform error text
        reason: String,
    },

    /// A required export is missing from the loaded agent image.
    #[error("Export '{name}' not found in module at {module}")]
    ExportNotFound
    {
        /// Export name
        name: String,
        /// Module base address
        module: Address,
    },

    /// The remote image headers or export tables are malformed.
    #[error("Invalid PE image at {module}: {reason}")]
    InvalidImage
    {
        /// Module base address
        module: Address,
        /// Parser error text
        reason: String,
    },

    /// Debug registers read back differently than they were written
    ///
    /// Reported and logged only. The thread keeps running with whatever the
    /// OS accepted.
    #[error("Debug register verification failed on thread {thread}: expected DR7 0x{expected:x}, read 0x{actual:x}")]
    VerificationMismatch
    {
        /// Thread whose context was verified
        thread: ThreadId,
        /// DR7 value that was written
        expected: u64,
        /// DR7 value that was read back
        actual: u64,
    },

    /// Exception handlers in the target were still running when the drain
    /// timeout elapsed. Reported and logged only.
    #[error("{active} agent handler(s) still active after {waited:?}")]
    ShutdownTimeout
    {
        /// Handler count when the wait gave up
        active: u32,
        /// How long shutdown waited
        waited: Duration,
    },

    /// Failed to read target memory.
    #[error("Failed to read {size} bytes at {address}: {reason}")]
    ReadFailed
    {
        /// Start address
        address: Address,
        /// Number of bytes requested
        size: usize,
        /// Platform error text
        reason: String,
    },

    /// Failed to write target memory.
    #[error("Failed to write {size} bytes at {address}: {reason}")]
    WriteFailed
    {
        /// Start address
        address: Address,
        /// Number of bytes written
        size: usize,
        /// Platform error text
        reason: String,
    },

    /// Failed to allocate or free target memory.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A thread operation (suspend, resume, context access) failed
    ///
    /// Threads can exit at any time, so this is expected occasionally while
    /// iterating a thread snapshot.
    #[error("Thread {thread} {operation} failed: {reason}")]
    ThreadFailed
    {
        /// Thread the operation targeted
        thread: ThreadId,
        /// Operation name (e.g. "suspend", "get context")
        operation: &'static str,
        /// Platform error text
        reason: String,
    },

    /// No thread of the target accepted a debug register update.
    #[error("Hardware breakpoint could not be programmed on any thread: {0}")]
    HardwareBreakpointFailed(String),

    /// The target's module list could not be obtained.
    #[error("Failed to enumerate modules: {0}")]
    ModuleEnumerationFailed(String),

    /// The shared channel could not be created, opened or validated.
    #[error("Shared channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// This build has no backend for the host OS.
    #[error("Watchpoints are only supported on Windows targets")]
    UnsupportedPlatform,

    /// Windows API error
    ///
    /// Wraps the `HRESULT` and message produced by the `windows` crate.
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TripwireError
{
    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind
    {
        match self {
            Self::NoFreeSlot
            | Self::InvalidSize(_)
            | Self::Misaligned { .. }
            | Self::AlreadyActive { .. }
            | Self::InvalidSlot(_)
            | Self::InvalidArgument(_) => ErrorKind::Configuration,
            Self::AgentMissing(_)
            | Self::AgentLoadFailed(_)
            | Self::AgentInitFailed { .. }
            | Self::RemoteCallTimedOut { .. }
            | Self::RemoteCallFailed(_) => ErrorKind::Injection,
            Self::PageNotAccessible { .. } | Self::ProtectionChangeFailed { .. } => ErrorKind::Protection,
            Self::ExportNotFound { .. } | Self::InvalidImage { .. } => ErrorKind::ExportResolution,
            Self::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
            Self::ShutdownTimeout { .. } => ErrorKind::ShutdownTimeout,
            Self::ReadFailed { .. }
            | Self::WriteFailed { .. }
            | Self::AllocationFailed(_)
            | Self::ThreadFailed { .. }
            | Self::HardwareBreakpointFailed(_)
            | Self::ModuleEnumerationFailed(_)
            | Self::ChannelUnavailable(_) => ErrorKind::Target,
            Self::UnsupportedPlatform => ErrorKind::Platform,
            #[cfg(windows)]
            Self::Windows(_) => ErrorKind::Platform,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this error is only reported and never aborts an operation.
    #[must_use]
    pub fn is_advisory(&self) -> bool
    {
        matches!(self.kind(), ErrorKind::VerificationMismatch | ErrorKind::ShutdownTimeout)
    }
}

/// Result type alias for watchpoint operations
pub type Result<T> = std::result::Result<T, TripwireError>;
