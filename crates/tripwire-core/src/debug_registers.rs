//! # x86 Debug Register Encoding
//!
//! Pure encoding of the DR0-DR3 / DR6 / DR7 registers used for hardware
//! watchpoints. Nothing in this module touches a thread; backends read a
//! [`DebugContext`], mutate it here, and write it back.
//!
//! ## DR7 layout (per slot `n` in 0..4)
//!
//! | Field | Bits | Meaning |
//! |-------|------|---------|
//! | L*n* | `n*2` | Local enable |
//! | R/W*n* | `16 + n*4` .. `+2` | Condition: 00 execute, 01 write, 10 I/O, 11 read/write |
//! | LEN*n* | `18 + n*4` .. `+2` | Size: 00 1 byte, 01 2 bytes, 10 8 bytes, 11 4 bytes |
//!
//! The same layout applies to 32-bit contexts; only the low 32 bits are used.
//!
//! ## See Also
//!
//! - Intel SDM Vol. 3B, section 17.2 "Debug Registers"

use std::fmt;

use crate::error::{Result, TripwireError};
use crate::types::{AccessMode, Address};

/// Number of address slots (DR0-DR3).
pub const SLOT_COUNT: usize = 4;

/// EFLAGS trap flag (single-step), bit 8.
pub const TRAP_FLAG: u64 = 1 << 8;

/// Index of a debug address register (0-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(u8);

impl SlotIndex
{
    /// All four slots in allocation order.
    pub const ALL: [SlotIndex; SLOT_COUNT] = [SlotIndex(0), SlotIndex(1), SlotIndex(2), SlotIndex(3)];

    /// Create a slot index
    ///
    /// ## Errors
    ///
    /// - `InvalidSlot`: `index` is 4 or more
    pub fn new(index: u8) -> Result<Self>
    {
        if usize::from(index) < SLOT_COUNT {
            Ok(Self(index))
        } else {
            Err(TripwireError::InvalidSlot(index))
        }
    }

    /// Slot number as an array index
    #[must_use]
    pub const fn index(self) -> usize
    {
        self.0 as usize
    }

    /// Slot number as stored in the shared channel
    #[must_use]
    pub const fn raw(self) -> u8
    {
        self.0
    }
}

impl fmt::Display for SlotIndex
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "DR{}", self.0)
    }
}

/// Access that triggers a debug register (R/W field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakCondition
{
    /// Instruction fetch (`00`)
    Execute,
    /// Data write (`01`)
    Write,
    /// I/O port access (`10`), requires CR4.DE
    Io,
    /// Data read or write (`11`)
    ReadWrite,
}

impl BreakCondition
{
    /// Two-bit R/W field value
    #[must_use]
    pub const fn bits(self) -> u64
    {
        match self {
            Self::Execute => 0b00,
            Self::Write => 0b01,
            Self::Io => 0b10,
            Self::ReadWrite => 0b11,
        }
    }

    /// Decode a two-bit R/W field (higher bits are ignored).
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self
    {
        match bits & 0b11 {
            0b00 => Self::Execute,
            0b01 => Self::Write,
            0b10 => Self::Io,
            _ => Self::ReadWrite,
        }
    }
}

impl From<AccessMode> for BreakCondition
{
    fn from(access: AccessMode) -> Self
    {
        match access {
            AccessMode::WriteOnly => Self::Write,
            AccessMode::ReadWrite => Self::ReadWrite,
        }
    }
}

/// Length of the watched range (LEN field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakSize
{
    /// 1 byte (`00`)
    One,
    /// 2 bytes (`01`)
    Two,
    /// 4 bytes (`11`)
    Four,
    /// 8 bytes (`10`), x86-64 only
    Eight,
}

impl BreakSize
{
    /// Map a byte length onto the LEN field
    ///
    /// ## Errors
    ///
    /// - `InvalidSize`: `len` is not 1, 2, 4 or 8
    pub fn from_len(len: u32) -> Result<Self>
    {
        match len {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            other => Err(TripwireError::InvalidSize(other)),
        }
    }

    /// Length in bytes
    #[must_use]
    pub const fn len(self) -> u32
    {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Two-bit LEN field value
    #[must_use]
    pub const fn bits(self) -> u64
    {
        match self {
            Self::One => 0b00,
            Self::Two => 0b01,
            Self::Eight => 0b10,
            Self::Four => 0b11,
        }
    }

    /// Decode a two-bit LEN field (higher bits are ignored).
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self
    {
        match bits & 0b11 {
            0b00 => Self::One,
            0b01 => Self::Two,
            0b10 => Self::Eight,
            _ => Self::Four,
        }
    }
}

/// The DR7 control register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dr7(pub u64);

impl Dr7
{
    const fn enable_shift(slot: SlotIndex) -> u32
    {
        slot.0 as u32 * 2
    }

    const fn condition_shift(slot: SlotIndex) -> u32
    {
        16 + slot.0 as u32 * 4
    }

    const fn size_shift(slot: SlotIndex) -> u32
    {
        18 + slot.0 as u32 * 4
    }

    /// Enable `slot` with the given condition and size, leaving other slots untouched.
    #[must_use]
    pub const fn with_slot(self, slot: SlotIndex, condition: BreakCondition, size: BreakSize) -> Self
    {
        let mut value = self.0;
        value |= 1 << Self::enable_shift(slot);
        value &= !(0b11 << Self::condition_shift(slot));
        value |= condition.bits() << Self::condition_shift(slot);
        value &= !(0b11 << Self::size_shift(slot));
        value |= size.bits() << Self::size_shift(slot);
        Self(value)
    }

    /// Clear only the local enable bit of `slot`.
    #[must_use]
    pub const fn without_slot(self, slot: SlotIndex) -> Self
    {
        Self(self.0 & !(1 << Self::enable_shift(slot)))
    }

    /// Whether `slot` is locally enabled.
    #[must_use]
    pub const fn is_enabled(self, slot: SlotIndex) -> bool
    {
        self.0 & (1 << Self::enable_shift(slot)) != 0
    }

    /// R/W field of `slot`
    #[must_use]
    pub const fn condition(self, slot: SlotIndex) -> BreakCondition
    {
        BreakCondition::from_bits(self.0 >> Self::condition_shift(slot))
    }

    /// LEN field of `slot`
    #[must_use]
    pub const fn size(self, slot: SlotIndex) -> BreakSize
    {
        BreakSize::from_bits(self.0 >> Self::size_shift(slot))
    }

    /// Condition and size of `slot`, or `None` when the slot is disabled.
    #[must_use]
    pub const fn decode(self, slot: SlotIndex) -> Option<(BreakCondition, BreakSize)>
    {
        if self.is_enabled(slot) {
            Some((self.condition(slot), self.size(slot)))
        } else {
            None
        }
    }
}

impl fmt::LowerHex for Dr7
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Debug-relevant part of a thread context
///
/// Backends fill this from `CONTEXT` (x64) or `WOW64_CONTEXT` (x86) with
/// `CONTEXT_DEBUG_REGISTERS | CONTEXT_CONTROL` and write it back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugContext
{
    /// DR0-DR3
    pub dr: [u64; SLOT_COUNT],
    /// DR6 status
    pub dr6: u64,
    /// DR7 control
    pub dr7: u64,
    /// EFLAGS
    pub flags: u64,
}

impl DebugContext
{
    /// Point `slot` at `address` and enable it.
    pub fn program(&mut self, slot: SlotIndex, address: Address, condition: BreakCondition, size: BreakSize)
    {
        self.dr[slot.index()] = address.value();
        self.dr7 = Dr7(self.dr7).with_slot(slot, condition, size).0;
    }

    /// Zero the address register and clear the enable bit of `slot`.
    pub fn clear(&mut self, slot: SlotIndex)
    {
        self.dr[slot.index()] = 0;
        self.dr7 = Dr7(self.dr7).without_slot(slot).0;
    }

    /// Whether `slot` holds exactly this watch.
    #[must_use]
    pub fn holds(&self, slot: SlotIndex, address: Address, condition: BreakCondition, size: BreakSize) -> bool
    {
        self.dr[slot.index()] == address.value() && Dr7(self.dr7).decode(slot) == Some((condition, size))
    }

    /// Whether DR6 reports that `slot` fired.
    #[must_use]
    pub const fn slot_hit(&self, slot: SlotIndex) -> bool
    {
        self.dr6 & (1 << slot.0) != 0
    }

    /// Whether single-stepping is armed.
    #[must_use]
    pub const fn has_trap_flag(&self) -> bool
    {
        self.flags & TRAP_FLAG != 0
    }

    /// Disarm single-stepping.
    pub fn clear_trap_flag(&mut self)
    {
        self.flags &= !TRAP_FLAG;
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const CONDITIONS: [BreakCondition; 4] = [
        BreakCondition::Execute,
        BreakCondition::Write,
        BreakCondition::Io,
        BreakCondition::ReadWrite,
    ];
    const SIZES: [BreakSize; 4] = [BreakSize::One, BreakSize::Two, BreakSize::Four, BreakSize::Eight];

    #[test]
    fn test_dr7_round_trip_every_slot()
    {
        for slot in SlotIndex::ALL {
            for condition in CONDITIONS {
                for size in SIZES {
                    let dr7 = Dr7::default().with_slot(slot, condition, size);
                    assert_eq!(dr7.decode(slot), Some((condition, size)), "{slot} {condition:?} {size:?}");
                    for other in SlotIndex::ALL.into_iter().filter(|s| *s != slot) {
                        assert_eq!(dr7.decode(other), None);
                    }
                }
            }
        }
    }

    #[test]
    fn test_dr7_other_slots_unchanged()
    {
        let base = Dr7::default()
            .with_slot(SlotIndex::ALL[0], BreakCondition::ReadWrite, BreakSize::Eight)
            .with_slot(SlotIndex::ALL[3], BreakCondition::Execute, BreakSize::One);
        let updated = base.with_slot(SlotIndex::ALL[1], BreakCondition::Write, BreakSize::Four);

        assert_eq!(
            updated.decode(SlotIndex::ALL[0]),
            Some((BreakCondition::ReadWrite, BreakSize::Eight))
        );
        assert_eq!(updated.decode(SlotIndex::ALL[3]), Some((BreakCondition::Execute, BreakSize::One)));
        assert_eq!(updated.decode(SlotIndex::ALL[1]), Some((BreakCondition::Write, BreakSize::Four)));
        assert_eq!(updated.decode(SlotIndex::ALL[2]), None);
    }

    #[test]
    fn test_dr7_bit_positions()
    {
        // Slot 2, write, 4 bytes: L2 = bit 4, R/W2 = bits 24-25, LEN2 = bits 26-27
        let dr7 = Dr7::default().with_slot(SlotIndex::ALL[2], BreakCondition::Write, BreakSize::Four);
        assert_eq!(dr7.0, (1 << 4) | (0b01 << 24) | (0b11 << 26));
    }

    #[test]
    fn test_size_encoding_is_not_linear()
    {
        assert_eq!(BreakSize::Eight.bits(), 0b10);
        assert_eq!(BreakSize::Four.bits(), 0b11);
        assert_eq!(BreakSize::from_len(8).unwrap(), BreakSize::Eight);
        assert!(BreakSize::from_len(3).is_err());
    }

    #[test]
    fn test_clear_only_touches_address_and_enable()
    {
        let slot = SlotIndex::ALL[1];
        let mut context = DebugContext::default();
        context.program(slot, Address::new(0x1234_5678), BreakCondition::ReadWrite, BreakSize::Two);
        context.clear(slot);

        assert_eq!(context.dr[1], 0);
        assert!(!Dr7(context.dr7).is_enabled(slot));
        assert_eq!(Dr7(context.dr7).condition(slot), BreakCondition::ReadWrite);
        assert_eq!(Dr7(context.dr7).size(slot), BreakSize::Two);
    }

    #[test]
    fn test_slot_index_bounds()
    {
        assert!(SlotIndex::new(3).is_ok());
        assert!(matches!(SlotIndex::new(4), Err(TripwireError::InvalidSlot(4))));
    }

    #[test]
    fn test_trap_flag()
    {
        let mut context = DebugContext {
            flags: 0x246 | TRAP_FLAG,
            ..DebugContext::default()
        };
        assert!(context.has_trap_flag());
        context.clear_trap_flag();
        assert_eq!(context.flags, 0x246);
    }
}
