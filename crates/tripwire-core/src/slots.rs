//! Hardware breakpoint slot registry.
//!
//! One registry exists per controller and is shared by every session it
//! creates (`Arc<Mutex<SlotRegistry>>`). A slot belongs to at most one session
//! at a time.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::debug_registers::{BreakCondition, BreakSize, SlotIndex, SLOT_COUNT};
use crate::error::{Result, TripwireError};
use crate::types::Address;

/// Ownership record for one of DR0-DR3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointSlot
{
    /// Register index
    pub index: SlotIndex,
    /// Whether a session owns the slot
    pub in_use: bool,
    /// Programmed address (meaningful while in use)
    pub address: Address,
    /// Programmed condition
    pub condition: BreakCondition,
    /// Programmed length
    pub size: BreakSize,
}

impl BreakpointSlot
{
    const fn free(index: SlotIndex) -> Self
    {
        Self {
            index,
            in_use: false,
            address: Address::ZERO,
            condition: BreakCondition::Execute,
            size: BreakSize::One,
        }
    }
}

/// Allocation table for the four debug address registers
#[derive(Debug, Clone)]
pub struct SlotRegistry
{
    slots: [BreakpointSlot; SLOT_COUNT],
}

/// Registry handle shared between the sessions of one controller.
pub type SharedSlots = Arc<Mutex<SlotRegistry>>;

impl SlotRegistry
{
    /// Create a registry with all slots free
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            slots: SlotIndex::ALL.map(BreakpointSlot::free),
        }
    }

    /// Create a registry wrapped for sharing between sessions
    #[must_use]
    pub fn shared() -> SharedSlots
    {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Claim the lowest free slot
    ///
    /// ## Errors
    ///
    /// - `NoFreeSlot`: all four slots are owned
    pub fn allocate(&mut self, address: Address, condition: BreakCondition, size: BreakSize) -> Result<SlotIndex>
    {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| !slot.in_use)
            .ok_or(TripwireError::NoFreeSlot)?;

        slot.in_use = true;
        slot.address = address;
        slot.condition = condition;
        slot.size = size;
        debug!("Allocated {} for {address}", slot.index);
        Ok(slot.index)
    }

    /// Return a slot to the pool. Returns `false` if it was not in use.
    pub fn release(&mut self, index: SlotIndex) -> bool
    {
        let slot = &mut self.slots[index.index()];
        let was_in_use = slot.in_use;
        *slot = BreakpointSlot::free(index);
        if was_in_use {
            debug!("Released {index}");
        }
        was_in_use
    }

    /// Current record for `index`
    #[must_use]
    pub fn slot(&self, index: SlotIndex) -> &BreakpointSlot
    {
        &self.slots[index.index()]
    }

    /// Number of owned slots
    #[must_use]
    pub fn in_use(&self) -> usize
    {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }
}

impl Default for SlotRegistry
{
    fn default() -> Self
    {
        Self::new()
    }
}
