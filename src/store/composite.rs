//! Composite-key geometry.
//!
//! A composite key is a contiguous run of exactly `predicate_count`
//! KeyPointers stored with one record. Nothing is materialized for the
//! composite itself; [`KeyAccessor`] holds the geometry (predicate count and
//! entry size) and converts between record addresses, individual KeyPointer
//! addresses, and the record start recovered from any KeyPointer inside it.
//!
//! There is deliberately no "full composite" equality: the store only ever
//! compares one predicate's key at a time.

use std::marker::PhantomData;

use crate::addr::Address;
use crate::error::{ChaindexError, Result};
use crate::hash::{IndexKey, KeyComparer, mix_ordinal};
use crate::store::key_pointer::KeyPointer;
use crate::store::record::RECORD_HEADER_SIZE;

/// Geometry of composite keys for one group.
#[derive(Debug, Clone, Copy)]
pub struct KeyAccessor<K> {
    predicate_count: u8,
    entry_size: u64,
    _key: PhantomData<K>,
}

impl<K: IndexKey> KeyAccessor<K> {
    /// Build the accessor for a group of `predicate_count` predicates.
    ///
    /// Rejects zero predicates, and key layouts whose offsets would not fit
    /// the 16-bit `offset_to_start_of_keys` field.
    pub fn new(predicate_count: usize) -> Result<Self> {
        if predicate_count == 0 || predicate_count > usize::from(u8::MAX) {
            return Err(ChaindexError::InvalidArgument(format!(
                "a group needs 1..=255 predicates, got {predicate_count}"
            )));
        }
        if std::mem::align_of::<K>() > 8 {
            return Err(ChaindexError::InvalidArgument(format!(
                "key alignment {} exceeds 8",
                std::mem::align_of::<K>()
            )));
        }
        let entry_size = KeyPointer::<K>::entry_size();
        let max_offset = entry_size * (predicate_count as u64 - 1);
        if max_offset > u64::from(u16::MAX) {
            return Err(ChaindexError::InvalidArgument(format!(
                "composite of {predicate_count} keys x {entry_size} bytes overflows the \
                 key-offset field"
            )));
        }
        Ok(KeyAccessor {
            predicate_count: predicate_count as u8,
            entry_size,
            _key: PhantomData,
        })
    }

    #[inline]
    pub fn predicate_count(&self) -> u8 {
        self.predicate_count
    }

    #[inline]
    pub fn entry_size(&self) -> u64 {
        self.entry_size
    }

    /// Offset stored in predicate `i`'s KeyPointer.
    #[inline]
    pub fn offset_to_start(&self, ordinal: u8) -> u16 {
        (u64::from(ordinal) * self.entry_size) as u16
    }

    /// Total on-log size of one record: header, composite, RecordId.
    #[inline]
    pub fn record_size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.entry_size * u64::from(self.predicate_count) + 8
    }

    /// Log address of predicate `i`'s KeyPointer within the record at
    /// `record_addr`.
    #[inline]
    pub fn key_pointer_address(&self, record_addr: Address, ordinal: u8) -> Address {
        record_addr.plus(RECORD_HEADER_SIZE + u64::from(ordinal) * self.entry_size)
    }

    /// Byte offset of the RecordId field within a record.
    #[inline]
    pub fn record_id_offset(&self) -> u64 {
        RECORD_HEADER_SIZE + self.entry_size * u64::from(self.predicate_count)
    }

    /// Recover the record's start address given the address of any
    /// KeyPointer inside it, using the KeyPointer's stored back-offset.
    #[inline]
    pub fn record_address_from_key_pointer(
        &self,
        kp_addr: Address,
        kp: &KeyPointer<K>,
    ) -> Address {
        kp_addr.minus(u64::from(kp.offset_to_start()) + RECORD_HEADER_SIZE)
    }

    /// Reference to predicate `i`'s KeyPointer inside the composite whose
    /// first KeyPointer lives at `first`.
    ///
    /// # Safety
    /// `first` must point at the first KeyPointer of a live composite of
    /// this accessor's geometry, valid for `'a`.
    #[inline]
    pub unsafe fn key_pointer_at<'a>(&self, first: *mut u8, ordinal: u8) -> &'a KeyPointer<K> {
        debug_assert!(ordinal < self.predicate_count);
        // SAFETY: per contract; ordinal is within the composite run.
        unsafe {
            KeyPointer::from_ptr(first.add((u64::from(ordinal) * self.entry_size) as usize))
        }
    }

    /// Chain hash for predicate `ordinal` and `key`: the comparer's key
    /// hash with the ordinal mixed in, so identical keys of different
    /// predicates land in different chains.
    #[inline]
    pub fn chain_hash<C: KeyComparer<K> + ?Sized>(&self, comparer: &C, ordinal: u8, key: &K) -> u64 {
        mix_ordinal(comparer.hash(key), ordinal)
    }

    /// Whether `kp` is the chain entry for (`ordinal`, `key`).
    #[inline]
    pub fn matches<C: KeyComparer<K> + ?Sized>(
        &self,
        comparer: &C,
        kp: &KeyPointer<K>,
        ordinal: u8,
        key: &K,
    ) -> bool {
        kp.ordinal() == ordinal && kp.key().is_some_and(|k| comparer.equals(k, key))
    }
}
