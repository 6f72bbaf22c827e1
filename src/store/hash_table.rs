//! Open-addressed hash table rooting the predicate chains.
//!
//! Each slot is one atomic 64-bit word packing a 48-bit chain-head address,
//! a 15-bit tag, and a tentative bit used for two-phase slot installation.
//! Slots are never deleted; a chain that empties keeps its slot with an
//! invalid head address. All chain splicing happens through [`HashTable::cas`]
//! on these words.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::addr::{ADDRESS_BITS, ADDRESS_MASK, Address};
use crate::error::{ChaindexError, Result};
use crate::hash::tag_from_hash;

const TAG_SHIFT: u32 = ADDRESS_BITS;
const TAG_MASK: u64 = 0x7fff;
const TENTATIVE_BIT: u64 = 1 << 63;

/// Slots inspected past the home slot before declaring the table full.
const PROBE_WINDOW: usize = 128;

/// Pack a slot entry from its parts.
#[inline]
pub fn pack_entry(tag: u16, address: Address) -> u64 {
    (u64::from(tag) << TAG_SHIFT) | address.offset()
}

#[inline]
pub fn entry_address(entry: u64) -> Address {
    Address::new(entry & ADDRESS_MASK)
}

#[inline]
pub fn entry_tag(entry: u64) -> u16 {
    ((entry >> TAG_SHIFT) & TAG_MASK) as u16
}

#[inline]
fn is_tentative(entry: u64) -> bool {
    entry & TENTATIVE_BIT != 0
}

/// The bucket array. Size is fixed at registration.
pub struct HashTable {
    slots: Box<[AtomicU64]>,
    index_bits: u32,
}

impl HashTable {
    /// Allocate a table of `size` slots (`size` must be a power of two,
    /// validated by settings).
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let slots = (0..size).map(|_| AtomicU64::new(0)).collect();
        HashTable {
            slots,
            index_bits: size.trailing_zeros(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn home_slot(&self, hash: u64) -> usize {
        (hash as usize) & (self.slots.len() - 1)
    }

    #[inline]
    fn tag(&self, hash: u64) -> u16 {
        tag_from_hash(hash, self.index_bits)
    }

    #[inline]
    fn slot_at(&self, i: usize) -> &AtomicU64 {
        &self.slots[i & (self.slots.len() - 1)]
    }

    /// Read-only lookup. Returns the slot index and its current entry, or
    /// `None` when no chain exists for this hash.
    pub fn find_tag(&self, hash: u64) -> Option<(usize, u64)> {
        let tag = self.tag(hash);
        let home = self.home_slot(hash);
        for probe in 0..PROBE_WINDOW {
            let i = (home + probe) & (self.slots.len() - 1);
            let entry = self.slot_at(i).load(Ordering::Acquire);
            if entry == 0 {
                return None;
            }
            if !is_tentative(entry) && entry_tag(entry) == tag {
                return Some((i, entry));
            }
        }
        None
    }

    /// Locate or install the slot for this hash.
    ///
    /// Installation is two-phase: CAS a tentative entry into a free slot,
    /// re-scan the probe window for a competing entry with the same tag,
    /// then publish by clearing the tentative bit. The loser of a race
    /// withdraws and retries, so at most one slot per tag survives.
    pub fn find_or_create_tag(&self, hash: u64) -> Result<(usize, u64)> {
        let tag = self.tag(hash);
        let home = self.home_slot(hash);
        let backoff = Backoff::new();

        'restart: loop {
            let mut free_slot = None;
            for probe in 0..PROBE_WINDOW {
                let i = (home + probe) & (self.slots.len() - 1);
                let entry = self.slot_at(i).load(Ordering::Acquire);
                if entry == 0 {
                    free_slot = Some(i);
                    break;
                }
                if !is_tentative(entry) && entry_tag(entry) == tag {
                    return Ok((i, entry));
                }
            }

            let Some(i) = free_slot else {
                return Err(ChaindexError::Internal(format!(
                    "hash table probe window exhausted (size {}, tag {tag})",
                    self.slots.len()
                )));
            };

            let tentative = pack_entry(tag, Address::INVALID) | TENTATIVE_BIT;
            if self
                .slot_at(i)
                .compare_exchange(0, tentative, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                backoff.spin();
                continue 'restart;
            }

            // Duplicate scan: another writer may have installed the same tag
            // concurrently. Lower slot index wins the tie.
            for probe in 0..PROBE_WINDOW {
                let j = (home + probe) & (self.slots.len() - 1);
                if j == i {
                    continue;
                }
                let other = self.slot_at(j).load(Ordering::Acquire);
                if other != 0 && entry_tag(other) == tag {
                    let we_lose = !is_tentative(other) || j < i;
                    if we_lose {
                        self.slot_at(i).store(0, Ordering::Release);
                        backoff.spin();
                        continue 'restart;
                    }
                }
            }

            let published = pack_entry(tag, Address::INVALID);
            match self.slot_at(i).compare_exchange(
                tentative,
                published,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((i, published)),
                Err(_) => {
                    // Nobody else writes a tentative slot we own.
                    return Err(ChaindexError::Internal(
                        "tentative hash slot mutated by another writer".into(),
                    ));
                }
            }
        }
    }

    /// 64-bit compare-and-exchange on a slot. Returns the actual entry,
    /// which equals `expected` iff the swap happened.
    #[inline]
    pub fn cas(&self, slot: usize, expected: u64, new: u64) -> u64 {
        match self
            .slot_at(slot)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) => prev,
            Err(actual) => actual,
        }
    }

    #[inline]
    pub fn load(&self, slot: usize) -> u64 {
        self.slot_at(slot).load(Ordering::Acquire)
    }

    // ── Checkpoint support ──────────────────────────────────────────────

    /// Copy every slot into `out` (quiesced store only).
    pub fn snapshot_into(&self, out: &mut Vec<u64>) {
        out.clear();
        out.reserve(self.slots.len());
        for s in self.slots.iter() {
            out.push(s.load(Ordering::Acquire));
        }
    }

    /// Overwrite every slot from a recovered image.
    pub fn restore_from(&self, words: &[u64]) -> Result<()> {
        if words.len() != self.slots.len() {
            return Err(ChaindexError::Recovery(format!(
                "hash table image has {} slots, store expects {}",
                words.len(),
                self.slots.len()
            )));
        }
        for (s, w) in self.slots.iter().zip(words) {
            s.store(*w, Ordering::Release);
        }
        Ok(())
    }
}
