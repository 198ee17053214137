//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address in the target's address space
///
/// Addresses are always carried as `u64`, even for 32-bit (WOW64) targets, so
/// the controller can describe any target with one type. Code that has to hand
/// an address to a 32-bit target checks it with [`Address::to_u32`].
///
/// ## Example
///
/// ```rust
/// use tripwire_core::types::Address;
///
/// let addr = Address::from(0x0040_0010);
/// assert_eq!(addr.page_base(0x1000), Address::new(0x0040_0000));
/// assert!(addr.is_aligned(8));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is the null address.
    #[must_use]
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ## Example
    ///
    /// ```rust
    /// use tripwire_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Round down to the start of the page containing this address
    ///
    /// `page_size` must be a power of two.
    #[must_use]
    pub const fn page_base(self, page_size: u64) -> Self
    {
        Address(self.0 & !(page_size - 1))
    }

    /// Whether the address is a multiple of `alignment` (a power of two).
    #[must_use]
    pub const fn is_aligned(self, alignment: u64) -> bool
    {
        self.0 & (alignment - 1) == 0
    }

    /// Narrow to a 32-bit pointer, if it fits.
    #[must_use]
    pub fn to_u32(self) -> Option<u32>
    {
        u32::try_from(self.0).ok()
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
