//! Key hashing and equality for predicate keys.
//!
//! A group is registered with one [`KeyComparer`] that supplies hash and
//! equality over its predicate-key type. The comparer is a capability
//! handed in at registration; the index never inspects key types at
//! runtime. [`Xxh64Comparer`] is the default for any `Hash + Eq` key and
//! uses a fixed seed so hash placement is deterministic across runs and
//! across recovery.

use std::hash::{Hash, Hasher};
use xxhash_rust::xxh64::Xxh64;

/// Fixed seed for deterministic hashing.
pub(crate) const HASH_SEED: u64 = 0x517cc1b727220a95;

/// Marker for types that can be stored inline inside a
/// [`KeyPointer`](crate::store::KeyPointer).
///
/// Keys are copied byte-for-byte into log memory, so they must be plain
/// data: `Copy`, no drop glue, and alignment no stricter than 8 (the
/// KeyPointer header is two 64-bit words; the key follows them). The
/// alignment bound is checked once at group registration.
pub trait IndexKey: Copy + Send + Sync + 'static {}

impl<T: Copy + Send + Sync + 'static> IndexKey for T {}

/// Hash + equality capability over a predicate-key type.
///
/// Implementations must be pure: the same key must always produce the same
/// hash, and `equals` must be consistent with `hash` (equal keys hash
/// equally). Chain placement and recovery both depend on this.
pub trait KeyComparer<K>: Send + Sync + 'static {
    fn hash(&self, key: &K) -> u64;
    fn equals(&self, a: &K, b: &K) -> bool;
}

/// Default comparer: xxh64 with a fixed seed over the key's `Hash` impl.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh64Comparer;

impl<K: Hash + Eq> KeyComparer<K> for Xxh64Comparer {
    fn hash(&self, key: &K) -> u64 {
        let mut h = Xxh64::new(HASH_SEED);
        key.hash(&mut h);
        h.finish()
    }

    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// Mix a predicate ordinal into a key hash.
///
/// Chains are rooted per (predicate, key); two predicates producing the same
/// key value must land in different chains. The multiplier is the 64-bit
/// golden-ratio constant.
#[inline]
pub(crate) fn mix_ordinal(key_hash: u64, ordinal: u8) -> u64 {
    key_hash ^ (u64::from(ordinal).wrapping_add(1)).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Slot tag derived from a hash: the bits above the table-index bits,
/// truncated to the 15-bit tag field of a hash-table entry.
#[inline]
pub(crate) fn tag_from_hash(hash: u64, index_bits: u32) -> u16 {
    (((hash >> index_bits) & 0x7fff) as u16) | 1 // never zero; zero tag means free slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        let c = Xxh64Comparer;
        assert_eq!(
            KeyComparer::<u64>::hash(&c, &42),
            KeyComparer::<u64>::hash(&c, &42)
        );
    }

    #[test]
    fn test_hash_different_inputs() {
        let c = Xxh64Comparer;
        assert_ne!(
            KeyComparer::<u64>::hash(&c, &1),
            KeyComparer::<u64>::hash(&c, &2)
        );
    }

    #[test]
    fn test_equals_consistent_with_eq() {
        let c = Xxh64Comparer;
        assert!(KeyComparer::<u32>::equals(&c, &7, &7));
        assert!(!KeyComparer::<u32>::equals(&c, &7, &8));
    }

    #[test]
    fn test_ordinal_mixing_separates_chains() {
        let c = Xxh64Comparer;
        let h = KeyComparer::<u64>::hash(&c, &99);
        let h0 = mix_ordinal(h, 0);
        let h1 = mix_ordinal(h, 1);
        let h2 = mix_ordinal(h, 2);
        assert_ne!(h0, h1);
        assert_ne!(h1, h2);
        assert_ne!(h0, h2);
    }

    #[test]
    fn test_tag_never_zero() {
        for hash in [0u64, 1, u64::MAX, 0x8000_0000_0000_0000] {
            assert_ne!(tag_from_hash(hash, 20), 0);
        }
    }

    #[test]
    fn test_tag_fits_fifteen_bits() {
        assert!(tag_from_hash(u64::MAX, 4) <= 0x7fff);
    }
}
