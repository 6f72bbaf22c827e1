//! Pending-read contexts.
//!
//! A chain walk that reaches an on-disk address cannot finish on the
//! caller's stack: the query key and resume point are parked in a
//! [`PendingRead`] and the walk re-enters through
//! [`SecondaryStore::complete_read`](crate::store::SecondaryStore::complete_read).
//! The context owns a pooled sector-aligned buffer; the key bytes are copied
//! into it at suspension time and the same buffer serves as the record
//! scratch during completion.

use crate::addr::Address;
use crate::buffer::PooledBuffer;
use crate::hash::IndexKey;

/// One predicate-key lookup: the unit the chain walker resolves.
#[derive(Debug, Clone, Copy)]
pub struct QueryKey<K> {
    pub ordinal: u8,
    pub key: K,
    /// Chain hash (ordinal already mixed in).
    pub hash: u64,
}

/// Suspended chain walk, resumable after device I/O.
pub struct PendingRead<K> {
    pub(crate) query: QueryKey<K>,
    pub(crate) resume: Address,
    pub(crate) serial: u64,
    pub(crate) buffer: PooledBuffer,
}

impl<K: IndexKey> PendingRead<K> {
    /// Session serial number of the operation that suspended.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Address the walk will resume from.
    pub fn resume_address(&self) -> Address {
        self.resume
    }
}

/// How a chain hit was served; drives reader-path accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    /// Mutable region: served under the concurrent-reader protocol.
    Concurrent,
    /// Immutable in-memory region: single-reader path.
    Single,
    /// Completed from the device.
    Disk,
}

/// Result of one chain-walk step sequence.
pub enum ChainRead<K> {
    /// A KeyPointer matching the query key was found.
    Found {
        record_id: crate::addr::RecordId,
        /// The entry (or its record) is tombstoned for this predicate.
        deleted: bool,
        /// Continuation: the matched KeyPointer's previous address.
        next: Address,
        via: ReaderKind,
    },
    /// Chain exhausted (or no chain exists) without a match.
    NotFound,
    /// The walk fell below the in-memory boundary.
    Pending(PendingRead<K>),
}
