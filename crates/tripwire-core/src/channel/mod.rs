//! # Shared Channel
//!
//! Fixed-layout memory region mapped into both the controller and the target.
//! It carries the watch configuration to the agent, status back from it, and
//! a ring of hit records.
//!
//! ## Ownership
//!
//! Each field has exactly one writer (see [`layout`]). The ring is
//! single-producer/single-consumer: the agent owns the write index, the
//! poller owns the read index. Index updates use release stores and the
//! opposite side reads them with acquire loads, so an entry is always
//! complete before its index becomes visible. No cross-process locks are used.
//!
//! ## Views
//!
//! - [`SharedChannel`]: the controller's view. Creates and initialises the
//!   region, flips the active/shutdown flags and drains the ring.
//! - [`AgentChannel`]: the agent's view. Validates the magic, records hits and
//!   counts in-flight exception handlers.

pub mod layout;
pub mod region;

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::{fmt, hint};

pub use layout::{ChannelHeader, CHANNEL_SIZE, MAGIC, NO_SLOT, RING_CAPACITY};
pub use region::{HeapRegion, MappedRegion, RegionFactory};
use tracing::debug;

use crate::error::{Result, TripwireError};
use crate::types::{Address, ProcessId, ThreadId};

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(0);

/// Object namespace for the channel's mapping name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelNamespace
{
    /// `Local\`: visible to processes in the controller's session
    #[default]
    Local,
    /// `Global\`: visible across sessions (needs `SeCreateGlobalPrivilege`)
    Global,
}

impl fmt::Display for ChannelNamespace
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Global => write!(f, "Global"),
        }
    }
}

/// Build a channel name unique within this controller process.
#[must_use]
pub fn channel_name(namespace: ChannelNamespace, prefix: &str, target: ProcessId) -> String
{
    let serial = NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed);
    format!("{namespace}\\{prefix}_{}_{target}_{serial}", std::process::id())
}

/// Typed atomic accessors over a region
struct View
{
    region: Box<dyn MappedRegion>,
}

impl View
{
    fn new(region: Box<dyn MappedRegion>) -> Result<Self>
    {
        if region.len() < CHANNEL_SIZE {
            return Err(TripwireError::ChannelUnavailable(format!(
                "region holds {} bytes, channel needs {CHANNEL_SIZE}",
                region.len()
            )));
        }
        if region.base().align_offset(8) != 0 {
            return Err(TripwireError::ChannelUnavailable("region is not 8-byte aligned".to_string()));
        }
        Ok(Self { region })
    }

    fn word(&self, offset: usize) -> &AtomicU32
    {
        debug_assert!(offset % 4 == 0 && offset + 4 <= CHANNEL_SIZE);
        // SAFETY: `View::new` checked size and alignment, every offset used is
        // 4-aligned and inside the channel, and the region outlives `self`.
        unsafe { &*self.region.base().add(offset).cast::<AtomicU32>() }
    }

    fn load(&self, offset: usize) -> u32
    {
        self.word(offset).load(Ordering::Acquire)
    }

    fn store(&self, offset: usize, value: u32)
    {
        self.word(offset).store(value, Ordering::Release);
    }

    // u64 fields are stored as two little-endian halves; the watch address at
    // offset 12 is not 8-aligned.
    fn load_u64(&self, offset: usize) -> u64
    {
        let low = u64::from(self.load(offset));
        let high = u64::from(self.load(offset + 4));
        (high << 32) | low
    }

    #[allow(clippy::cast_possible_truncation)]
    fn store_u64(&self, offset: usize, value: u64)
    {
        self.store(offset, value as u32);
        self.store(offset + 4, (value >> 32) as u32);
    }

    fn write_header(&self, header: &ChannelHeader)
    {
        let bytes = header.to_bytes();
        for (index, chunk) in bytes.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.word(index * 4).store(value, Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    fn read_header(&self) -> ChannelHeader
    {
        let mut bytes = [0u8; layout::HEADER_SIZE];
        for (index, chunk) in bytes.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&self.load(index * 4).to_le_bytes());
        }
        // Cannot fail: the buffer is exactly one header long.
        ChannelHeader::from_bytes(&bytes).unwrap_or_default()
    }
}

/// Controller's view of the channel
pub struct SharedChannel
{
    view: View,
    name: String,
}

impl SharedChannel
{
    /// Create the named region through `factory`
    ///
    /// The region starts zeroed, which reads as invalid to any agent that
    /// opens it before [`SharedChannel::initialize`] runs.
    ///
    /// ## Errors
    ///
    /// - Any error from the factory
    /// - `ChannelUnavailable`: region too small or misaligned
    pub fn create<F: RegionFactory + ?Sized>(factory: &F, name: &str) -> Result<Self>
    {
        let region = factory.create(name, CHANNEL_SIZE)?;
        let view = View::new(region)?;
        debug!("Created shared channel {name} ({CHANNEL_SIZE} bytes)");
        Ok(Self {
            view,
            name: name.to_string(),
        })
    }

    /// Wrap an already created region (used by tests and diagnostics).
    pub fn from_region(region: Box<dyn MappedRegion>, name: &str) -> Result<Self>
    {
        Ok(Self {
            view: View::new(region)?,
            name: name.to_string(),
        })
    }

    /// Name the agent opens the channel by
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Write the complete header before the agent is loaded. Any `magic` in
    /// `header` is replaced by [`MAGIC`].
    pub fn initialize(&self, header: &ChannelHeader)
    {
        let header = ChannelHeader { magic: MAGIC, ..*header };
        self.view.write_header(&header);
    }

    /// Consistent-enough copy of the header for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> ChannelHeader
    {
        self.view.read_header()
    }

    /// Whether the magic is intact.
    #[must_use]
    pub fn is_valid(&self) -> bool
    {
        self.view.load(layout::MAGIC_OFFSET) == MAGIC
    }

    /// Clear the magic. Agents ignore an invalid channel.
    pub fn invalidate(&self)
    {
        self.view.store(layout::MAGIC_OFFSET, 0);
    }

    /// Set the active flag (guard re-arming allowed while set).
    pub fn set_active(&self, active: bool)
    {
        self.view.store(layout::ACTIVE_OFFSET, u32::from(active));
    }

    /// Whether the active flag is set.
    #[must_use]
    pub fn is_active(&self) -> bool
    {
        self.view.load(layout::ACTIVE_OFFSET) != 0
    }

    /// Set the shutdown-requested flag.
    pub fn set_shutdown_requested(&self, requested: bool)
    {
        self.view.store(layout::SHUTDOWN_REQUESTED_OFFSET, u32::from(requested));
    }

    /// Record the debug register slot the watch ended up in.
    pub fn set_breakpoint_slot(&self, slot: Option<u8>)
    {
        self.view
            .store(layout::BREAKPOINT_SLOT_OFFSET, slot.map_or(NO_SLOT, u32::from));
    }

    /// Number of agent exception handlers currently running.
    #[must_use]
    pub fn active_handlers(&self) -> u32
    {
        self.view.load(layout::ACTIVE_HANDLERS_OFFSET)
    }

    /// Hits recorded by the agent, including ones lost to overflow.
    #[must_use]
    pub fn hit_count(&self) -> u32
    {
        self.view.load(layout::HIT_COUNT_OFFSET)
    }

    /// Agent-owned write index (acquire).
    #[must_use]
    pub fn write_index(&self) -> u32
    {
        self.view.load(layout::WRITE_INDEX_OFFSET)
    }

    /// Poller-owned read index.
    #[must_use]
    pub fn read_index(&self) -> u32
    {
        self.view.load(layout::READ_INDEX_OFFSET)
    }

    /// Publish the read index (release).
    pub fn set_read_index(&self, index: u32)
    {
        self.view.store(layout::READ_INDEX_OFFSET, index);
    }

    /// Ring entry at `index` (taken modulo the capacity).
    #[must_use]
    pub fn entry(&self, index: u32) -> (Address, ThreadId)
    {
        let address = self.view.load_u64(layout::hit_address_offset(index));
        let thread = self.view.load(layout::hit_thread_offset(index));
        (Address::new(address), ThreadId(thread))
    }
}

impl fmt::Debug for SharedChannel
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SharedChannel")
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

/// Agent's view of the channel
///
/// Several threads of the target can fault at once. `record_hit` serialises
/// them with a process-local spin lock so the shared ring still sees a single
/// producer.
pub struct AgentChannel
{
    view: View,
    producer: AtomicBool,
}

/// Counts one in-flight exception handler until dropped
pub struct HandlerScope<'a>
{
    channel: &'a AgentChannel,
}

impl Drop for HandlerScope<'_>
{
    fn drop(&mut self)
    {
        self.channel
            .view
            .word(layout::ACTIVE_HANDLERS_OFFSET)
            .fetch_sub(1, Ordering::AcqRel);
    }
}

impl AgentChannel
{
    /// Open a region written by the controller
    ///
    /// ## Errors
    ///
    /// - `ChannelUnavailable`: region too small, or magic not set
    pub fn open(region: Box<dyn MappedRegion>) -> Result<Self>
    {
        let channel = Self {
            view: View::new(region)?,
            producer: AtomicBool::new(false),
        };
        if !channel.is_valid() {
            return Err(TripwireError::ChannelUnavailable("channel magic not set".to_string()));
        }
        Ok(channel)
    }

    /// Whether the controller still considers the channel valid.
    #[must_use]
    pub fn is_valid(&self) -> bool
    {
        self.view.load(layout::MAGIC_OFFSET) == MAGIC
    }

    /// Whether guard re-arming is allowed.
    #[must_use]
    pub fn is_active(&self) -> bool
    {
        self.view.load(layout::ACTIVE_OFFSET) != 0 && self.view.load(layout::SHUTDOWN_REQUESTED_OFFSET) == 0
    }

    /// Current configuration as written by the controller.
    #[must_use]
    pub fn header(&self) -> ChannelHeader
    {
        self.view.read_header()
    }

    /// Mark a handler as running; the count drops when the scope ends.
    #[must_use]
    pub fn enter_handler(&self) -> HandlerScope<'_>
    {
        self.view
            .word(layout::ACTIVE_HANDLERS_OFFSET)
            .fetch_add(1, Ordering::AcqRel);
        HandlerScope { channel: self }
    }

    /// Append a hit to the ring, overwriting the oldest entry when full.
    pub fn record_hit(&self, address: Address, thread: ThreadId)
    {
        while self
            .producer
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }

        let write = self.view.word(layout::WRITE_INDEX_OFFSET).load(Ordering::Relaxed);
        self.view.store_u64(layout::hit_address_offset(write), address.value());
        self.view.store(layout::hit_thread_offset(write), thread.raw());
        self.view.store(layout::WRITE_INDEX_OFFSET, write.wrapping_add(1));
        self.view.word(layout::HIT_COUNT_OFFSET).fetch_add(1, Ordering::Relaxed);

        self.producer.store(false, Ordering::Release);
    }

    /// Set the write index directly (used to simulate index wrap in tests).
    #[doc(hidden)]
    pub fn force_write_index(&self, index: u32)
    {
        self.view.store(layout::WRITE_INDEX_OFFSET, index);
    }

    /// Handlers currently in flight.
    #[must_use]
    pub fn active_handlers(&self) -> u32
    {
        self.view.load(layout::ACTIVE_HANDLERS_OFFSET)
    }
}
