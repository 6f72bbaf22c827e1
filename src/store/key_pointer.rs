//! KeyPointer: the per-predicate entry inside a stored composite key.
//!
//! A KeyPointer is a 16-byte header followed by the inline predicate key.
//! The header's first word is the hash-chain back-pointer; the second packs
//! the flag byte, the predicate ordinal, and the byte offset back to the
//! first KeyPointer of the owning composite. Both words are atomics because
//! readers traverse chains while the owning record is still being spliced;
//! the record's invalid bit is the publication fence (a KeyPointer alone
//! gives no cross-field guarantees).

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{ADDRESS_MASK, Address};
use crate::hash::IndexKey;

// Flag bits in the meta word's low byte.
const FLAG_NULL: u8 = 1 << 0;
const FLAG_DELETED: u8 = 1 << 1;
#[allow(dead_code)] // layout-reserved: keys are always inline today
const FLAG_OUT_OF_LINE_KEY: u8 = 1 << 2;
const FLAG_UNLINK_OLD: u8 = 1 << 3;
const FLAG_LINK_NEW: u8 = 1 << 4;

const META_FLAGS_SHIFT: u32 = 0;
const META_ORDINAL_SHIFT: u32 = 8;
const META_OFFSET_SHIFT: u32 = 16;

/// Mutation role of a KeyPointer within an update, decided by the
/// change-tracking diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Predicate returned no key; the slot occupies space but joins no chain.
    Null,
    /// Plain chain linkage.
    Link,
    /// Linkage into a chain the record newly joins (update path).
    LinkNew,
    /// Tombstone linkage into a chain the old record is leaving.
    UnlinkOld,
    /// Tombstone linkage for a full delete.
    Delete,
}

/// Per-predicate chain entry stored inline in a secondary record.
///
/// `#[repr(C)]`: two 64-bit header words, then the key. Key alignment is
/// bounded by 8 (checked at group registration), so
/// `size_of::<KeyPointer<K>>()` is always a multiple of 8 and every
/// KeyPointer inside a record is 8-byte aligned.
#[repr(C)]
pub struct KeyPointer<K> {
    prev: AtomicU64,
    meta: AtomicU64,
    key: MaybeUninit<K>,
}

impl<K: IndexKey> KeyPointer<K> {
    /// Size in bytes of one KeyPointer for this key type.
    #[inline]
    pub fn entry_size() -> u64 {
        std::mem::size_of::<KeyPointer<K>>() as u64
    }

    /// Build a KeyPointer in caller-owned scratch memory.
    ///
    /// `offset_to_start` is the byte distance back to the composite's first
    /// KeyPointer (`ordinal * entry_size`).
    pub fn build(ordinal: u8, offset_to_start: u16, key: Option<K>, role: KeyRole) -> Self {
        let mut flags = match role {
            KeyRole::Null => FLAG_NULL,
            KeyRole::Link => 0,
            KeyRole::LinkNew => FLAG_LINK_NEW,
            KeyRole::UnlinkOld => FLAG_DELETED | FLAG_UNLINK_OLD,
            KeyRole::Delete => FLAG_DELETED,
        };
        let key = match key {
            Some(k) => MaybeUninit::new(k),
            None => {
                flags |= FLAG_NULL;
                MaybeUninit::zeroed()
            }
        };
        let meta = (u64::from(flags) << META_FLAGS_SHIFT)
            | (u64::from(ordinal) << META_ORDINAL_SHIFT)
            | (u64::from(offset_to_start) << META_OFFSET_SHIFT);
        KeyPointer {
            prev: AtomicU64::new(Address::INVALID.offset()),
            meta: AtomicU64::new(meta),
            key,
        }
    }

    /// Reinterpret raw log memory as a KeyPointer.
    ///
    /// # Safety
    /// `ptr` must point at a KeyPointer written into live log memory,
    /// 8-byte aligned, and valid for `'a`.
    #[inline]
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a KeyPointer<K> {
        debug_assert_eq!(ptr as usize % 8, 0, "key pointer misaligned");
        // SAFETY: caller guarantees alignment, liveness, and 'a.
        unsafe { &*(ptr as *const KeyPointer<K>) }
    }

    // ── Chain pointer ────────────────────────────────────────────────────

    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::new(self.prev.load(Ordering::Acquire) & ADDRESS_MASK)
    }

    #[inline]
    pub fn set_previous_address(&self, addr: Address) {
        self.prev.store(addr.offset(), Ordering::Release);
    }

    // ── Meta word ────────────────────────────────────────────────────────

    #[inline]
    fn flags(&self) -> u8 {
        (self.meta.load(Ordering::Acquire) >> META_FLAGS_SHIFT) as u8
    }

    #[inline]
    pub fn ordinal(&self) -> u8 {
        (self.meta.load(Ordering::Acquire) >> META_ORDINAL_SHIFT) as u8
    }

    /// Byte offset from this KeyPointer back to the composite's first one.
    #[inline]
    pub fn offset_to_start(&self) -> u16 {
        (self.meta.load(Ordering::Acquire) >> META_OFFSET_SHIFT) as u16
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.flags() & FLAG_NULL != 0
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags() & FLAG_DELETED != 0
    }

    #[inline]
    pub fn is_unlink_old(&self) -> bool {
        self.flags() & FLAG_UNLINK_OLD != 0
    }

    #[inline]
    pub fn is_link_new(&self) -> bool {
        self.flags() & FLAG_LINK_NEW != 0
    }

    /// Atomically clear the update-routing flags after a successful splice.
    #[inline]
    pub fn clear_update_flags(&self) {
        let mask = !((u64::from(FLAG_UNLINK_OLD) | u64::from(FLAG_LINK_NEW)) << META_FLAGS_SHIFT);
        self.meta.fetch_and(mask, Ordering::AcqRel);
    }

    // ── Key access ───────────────────────────────────────────────────────

    /// The predicate key, if this slot is non-null.
    #[inline]
    pub fn key(&self) -> Option<&K> {
        if self.is_null() {
            None
        } else {
            // SAFETY: non-null KeyPointers are always built from Some(key).
            Some(unsafe { self.key.assume_init_ref() })
        }
    }

    /// Byte-copy this KeyPointer into log memory at `dst`.
    ///
    /// # Safety
    /// `dst` must be 8-byte aligned and valid for `entry_size()` bytes of
    /// writes, with no concurrent access (the record is still invalid).
    #[inline]
    pub unsafe fn copy_to(&self, dst: *mut u8) {
        debug_assert_eq!(dst as usize % 8, 0);
        // SAFETY: per contract; byte copy is fine for this repr(C) layout
        // (the atomics are plain u64 words).
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const Self as *const u8,
                dst,
                std::mem::size_of::<Self>(),
            );
        }
    }
}
