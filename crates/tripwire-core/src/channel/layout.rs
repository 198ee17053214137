//! Byte layout of the shared channel.
//!
//! Every field sits at a fixed little-endian offset so the controller and an
//! agent built separately (or for a different bitness) agree on it. The hit
//! ring follows the 80-byte header: 1024 addresses, then 1024 thread IDs.

use crate::error::{Result, TripwireError};

/// Validity marker written by the controller; zero means invalid.
pub const MAGIC: u32 = 0x5750_5254;
/// Breakpoint slot value when no debug register is assigned.
pub const NO_SLOT: u32 = u32::MAX;
/// Number of entries in the hit ring.
pub const RING_CAPACITY: u32 = 1024;

/// Magic/validity (controller)
pub const MAGIC_OFFSET: usize = 0;
/// Active flag (controller)
pub const ACTIVE_OFFSET: usize = 4;
/// Total hits recorded, including overwritten ones (agent)
pub const HIT_COUNT_OFFSET: usize = 8;
/// Watched address, u64 (controller)
pub const WATCH_ADDRESS_OFFSET: usize = 12;
/// Watch length in bytes (controller)
pub const BREAKPOINT_SIZE_OFFSET: usize = 20;
/// DR7 condition code (controller)
pub const BREAKPOINT_TYPE_OFFSET: usize = 24;
/// Debug register slot or [`NO_SLOT`] (controller)
pub const BREAKPOINT_SLOT_OFFSET: usize = 28;
/// Ring write index (agent)
pub const WRITE_INDEX_OFFSET: usize = 32;
/// Ring read index (controller)
pub const READ_INDEX_OFFSET: usize = 36;
/// Non-zero when the agent should guard and re-arm the page (controller)
pub const USE_PAGE_GUARD_OFFSET: usize = 40;
/// Watched page base, u64 (controller)
pub const PAGE_BASE_OFFSET: usize = 48;
/// Watched page size (controller)
pub const PAGE_SIZE_OFFSET: usize = 56;
/// Page protection before guarding (controller)
pub const ORIGINAL_PROTECTION_OFFSET: usize = 60;
/// Exception handlers currently executing in the agent (agent)
pub const ACTIVE_HANDLERS_OFFSET: usize = 64;
/// Set when teardown has started (controller)
pub const SHUTDOWN_REQUESTED_OFFSET: usize = 68;
/// Length of the fixed header
pub const HEADER_SIZE: usize = 80;
/// Ring of hit addresses, 8 bytes each (agent)
pub const HIT_ADDRESSES_OFFSET: usize = HEADER_SIZE;
/// Ring of hit thread IDs, 4 bytes each (agent)
pub const HIT_THREADS_OFFSET: usize = HIT_ADDRESSES_OFFSET + RING_CAPACITY as usize * 8;
/// Total mapping size
pub const CHANNEL_SIZE: usize = HIT_THREADS_OFFSET + RING_CAPACITY as usize * 4;

/// Offset of ring entry `slot`'s address.
#[must_use]
pub const fn hit_address_offset(slot: u32) -> usize
{
    HIT_ADDRESSES_OFFSET + (slot % RING_CAPACITY) as usize * 8
}

/// Offset of ring entry `slot`'s thread ID.
#[must_use]
pub const fn hit_thread_offset(slot: u32) -> usize
{
    HIT_THREADS_OFFSET + (slot % RING_CAPACITY) as usize * 4
}

/// Decoded channel header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelHeader
{
    /// [`MAGIC`] while valid
    pub magic: u32,
    /// Agent may re-arm the guard page while non-zero
    pub active: u32,
    /// Hits recorded by the agent
    pub hit_count: u32,
    /// Watched address
    pub watch_address: u64,
    /// Watch length in bytes
    pub breakpoint_size: u32,
    /// DR7 condition code
    pub breakpoint_type: u32,
    /// Debug register slot or [`NO_SLOT`]
    pub breakpoint_slot: u32,
    /// Ring write index
    pub write_index: u32,
    /// Ring read index
    pub read_index: u32,
    /// Page-guard mode flag
    pub use_page_guard: u32,
    /// Watched page base
    pub page_base: u64,
    /// Watched page size
    pub page_size: u32,
    /// Protection to restore on teardown
    pub original_protection: u32,
    /// Agent handlers in flight
    pub active_handlers: u32,
    /// Teardown started
    pub shutdown_requested: u32,
}

impl ChannelHeader
{
    /// Pack into the on-wire header bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE]
    {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut put32 = |offset: usize, value: u32| bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        put32(MAGIC_OFFSET, self.magic);
        put32(ACTIVE_OFFSET, self.active);
        put32(HIT_COUNT_OFFSET, self.hit_count);
        put32(BREAKPOINT_SIZE_OFFSET, self.breakpoint_size);
        put32(BREAKPOINT_TYPE_OFFSET, self.breakpoint_type);
        put32(BREAKPOINT_SLOT_OFFSET, self.breakpoint_slot);
        put32(WRITE_INDEX_OFFSET, self.write_index);
        put32(READ_INDEX_OFFSET, self.read_index);
        put32(USE_PAGE_GUARD_OFFSET, self.use_page_guard);
        put32(PAGE_SIZE_OFFSET, self.page_size);
        put32(ORIGINAL_PROTECTION_OFFSET, self.original_protection);
        put32(ACTIVE_HANDLERS_OFFSET, self.active_handlers);
        put32(SHUTDOWN_REQUESTED_OFFSET, self.shutdown_requested);
        bytes[WATCH_ADDRESS_OFFSET..WATCH_ADDRESS_OFFSET + 8].copy_from_slice(&self.watch_address.to_le_bytes());
        bytes[PAGE_BASE_OFFSET..PAGE_BASE_OFFSET + 8].copy_from_slice(&self.page_base.to_le_bytes());
        bytes
    }

    /// Unpack from header bytes
    ///
    /// ## Errors
    ///
    /// - `ChannelUnavailable`: fewer than [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self>
    {
        if bytes.len() < HEADER_SIZE {
            return Err(TripwireError::ChannelUnavailable(format!(
                "header needs {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let get32 = |offset: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_le_bytes(word)
        };
        let get64 = |offset: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_le_bytes(word)
        };

        Ok(Self {
            magic: get32(MAGIC_OFFSET),
            active: get32(ACTIVE_OFFSET),
            hit_count: get32(HIT_COUNT_OFFSET),
            watch_address: get64(WATCH_ADDRESS_OFFSET),
            breakpoint_size: get32(BREAKPOINT_SIZE_OFFSET),
            breakpoint_type: get32(BREAKPOINT_TYPE_OFFSET),
            breakpoint_slot: get32(BREAKPOINT_SLOT_OFFSET),
            write_index: get32(WRITE_INDEX_OFFSET),
            read_index: get32(READ_INDEX_OFFSET),
            use_page_guard: get32(USE_PAGE_GUARD_OFFSET),
            page_base: get64(PAGE_BASE_OFFSET),
            page_size: get32(PAGE_SIZE_OFFSET),
            original_protection: get32(ORIGINAL_PROTECTION_OFFSET),
            active_handlers: get32(ACTIVE_HANDLERS_OFFSET),
            shutdown_requested: get32(SHUTDOWN_REQUESTED_OFFSET),
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_documented_offsets()
    {
        assert_eq!(WATCH_ADDRESS_OFFSET, 12);
        assert_eq!(PAGE_BASE_OFFSET, 48);
        assert_eq!(SHUTDOWN_REQUESTED_OFFSET, 68);
        assert_eq!(HIT_ADDRESSES_OFFSET, 80);
        assert_eq!(HIT_THREADS_OFFSET, 80 + 8192);
        assert_eq!(CHANNEL_SIZE, 12368);
        assert_eq!(hit_address_offset(RING_CAPACITY + 1), 88);
        assert_eq!(hit_thread_offset(2), HIT_THREADS_OFFSET + 8);
    }

    #[test]
    fn test_header_fields_land_at_offsets()
    {
        let header = ChannelHeader {
            magic: MAGIC,
            watch_address: 0x1122_3344_5566_7788,
            breakpoint_slot: NO_SLOT,
            page_base: 0x0040_0000,
            original_protection: 0x04,
            ..ChannelHeader::default()
        };
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[12..20], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[28..32], &[0xff; 4]);
        assert_eq!(&bytes[48..56], &0x0040_0000u64.to_le_bytes());
        assert_eq!(&bytes[60..64], &4u32.to_le_bytes());
        assert_eq!(&bytes[44..48], &[0; 4]);
        assert_eq!(ChannelHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_short_header_rejected()
    {
        assert!(ChannelHeader::from_bytes(&[0u8; 40]).is_err());
    }
}
