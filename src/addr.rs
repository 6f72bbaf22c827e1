//! Logical log addresses and primary-record identifiers.
//!
//! Every byte the index ever writes lives at a monotonically increasing
//! 48-bit logical address. The upper 16 bits of the word are reserved so an
//! address always fits, together with a tag, inside a single 64-bit
//! hash-table slot that can be swapped with one CAS.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bits in a logical log address.
pub const ADDRESS_BITS: u32 = 48;

/// Mask covering the address portion of a packed word.
pub const ADDRESS_MASK: u64 = (1u64 << ADDRESS_BITS) - 1;

/// A logical address into a log-structured store.
///
/// `Address::INVALID` (zero) terminates every hash chain; real records never
/// start at offset zero because the log begins allocating past a one-page
/// preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(u64);

impl Address {
    /// The chain terminator. No record is ever stored here.
    pub const INVALID: Address = Address(0);

    /// Construct an address from a raw 48-bit offset.
    ///
    /// Debug-asserts that the upper 16 bits are clear.
    #[inline]
    pub fn new(offset: u64) -> Self {
        debug_assert_eq!(offset & !ADDRESS_MASK, 0, "address exceeds 48 bits");
        Address(offset & ADDRESS_MASK)
    }

    #[inline]
    pub fn offset(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Byte-offset arithmetic. Saturates at the 48-bit boundary in debug
    /// builds via the `new` assertion.
    #[inline]
    pub fn plus(self, bytes: u64) -> Self {
        Address::new(self.0 + bytes)
    }

    #[inline]
    pub fn minus(self, bytes: u64) -> Self {
        debug_assert!(self.0 >= bytes, "address arithmetic underflow");
        Address(self.0 - bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

// ── RecordId ───────────────────────────────────────────────────────────────

/// Opaque identifier of a primary-store record.
///
/// In practice this is the primary log address of the record, which makes it
/// sortable; the query engine relies on that ordering to merge chain streams
/// and break ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    pub const INVALID: RecordId = RecordId(0);

    #[inline]
    pub fn new(raw: u64) -> Self {
        RecordId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// View of the identifier as a primary log address.
    #[inline]
    pub fn as_address(self) -> Address {
        Address::new(self.0)
    }
}

impl From<Address> for RecordId {
    fn from(a: Address) -> Self {
        RecordId(a.offset())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}
