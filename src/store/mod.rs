//! The secondary store: a log-structured KV whose keys are composite keys
//! and whose values are primary RecordIds.
//!
//! One store backs one predicate group. It owns the hash table rooting every
//! (predicate, key) chain, the hybrid log holding the records, a buffer pool
//! for suspended reads, and the version/phase word sessions use to detect a
//! checkpoint pivot.
//!
//! # Insert
//!
//! An insert writes one record carrying the full composite and splices up to
//! `predicate_count` chains with one CAS each. Chains only ever grow
//! downward: a CAS that observes a competing head *below* the new record
//! adopts it as the new back-pointer and retries; a head *above* the new
//! record would invert the chain order, so the record is abandoned (still
//! invalid) and the whole insert re-runs.
//!
//! # Read
//!
//! A chain walk follows `previous_address` links from a hash-table head,
//! comparing the query key against each entry's KeyPointer for the same
//! predicate. Walks suspend into a [`PendingRead`] when they reach the
//! on-disk region.

pub mod composite;
pub mod hash_table;
pub mod key_pointer;
pub mod log;
pub mod pending;
pub mod record;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::Backoff;
use serde::Serialize;
use tracing::{trace, warn};

use crate::addr::{Address, RecordId};
use crate::buffer::BufferPool;
use crate::config::RegistrationSettings;
use crate::device::SharedDevice;
use crate::error::{ChaindexError, Result};
use crate::hash::{IndexKey, KeyComparer};

pub use self::composite::KeyAccessor;
pub use self::key_pointer::{KeyPointer, KeyRole};
pub use self::pending::{ChainRead, PendingRead, QueryKey, ReaderKind};

use self::hash_table::{HashTable, entry_address, entry_tag, pack_entry};
use self::log::{HybridLog, Region};
use self::record::{RECORD_HEADER_SIZE, RecordHeader};

/// Bounded retries for a whole-insert re-drive before we call it a bug.
const MAX_INSERT_ATTEMPTS: usize = 1_000;

// ── Checkpoint phase ───────────────────────────────────────────────────────

/// Checkpoint state machine phase, inherited by sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Rest,
    Prepare,
    InProgress,
    WaitFlush,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            1 => Phase::Prepare,
            2 => Phase::InProgress,
            3 => Phase::WaitFlush,
            _ => Phase::Rest,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Rest => 0,
            Phase::Prepare => 1,
            Phase::InProgress => 2,
            Phase::WaitFlush => 3,
        }
    }
}

// ── Sessions ───────────────────────────────────────────────────────────────

/// Per-flow handle on one store. Not thread-safe; one logical flow each.
#[derive(Debug, Clone)]
pub struct StoreSession {
    serial: u64,
    version: u32,
    phase: Phase,
}

impl StoreSession {
    /// Monotone per-session operation counter.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Re-read the store's version and phase after a pivot.
    pub fn refresh<K: IndexKey>(&mut self, store: &SecondaryStore<K>) {
        self.version = store.version.load(Ordering::Acquire);
        self.phase = Phase::from_u8(store.phase.load(Ordering::Acquire));
    }
}

// ── Statistics ─────────────────────────────────────────────────────────────

/// Monotone operation counters, mirrored into [`StatsSnapshot`] on demand.
#[derive(Debug, Default)]
pub struct StoreStats {
    inserts: AtomicU64,
    tombstone_inserts: AtomicU64,
    cas_adoptions: AtomicU64,
    insert_retries: AtomicU64,
    version_shifts: AtomicU64,
    elided_heads: AtomicU64,
    chain_reads: AtomicU64,
    pending_reads: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub inserts: u64,
    pub tombstone_inserts: u64,
    pub cas_adoptions: u64,
    pub insert_retries: u64,
    pub version_shifts: u64,
    pub elided_heads: u64,
    pub chain_reads: u64,
    pub pending_reads: u64,
}

impl StoreStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            tombstone_inserts: self.tombstone_inserts.load(Ordering::Relaxed),
            cas_adoptions: self.cas_adoptions.load(Ordering::Relaxed),
            insert_retries: self.insert_retries.load(Ordering::Relaxed),
            version_shifts: self.version_shifts.load(Ordering::Relaxed),
            elided_heads: self.elided_heads.load(Ordering::Relaxed),
            chain_reads: self.chain_reads.load(Ordering::Relaxed),
            pending_reads: self.pending_reads.load(Ordering::Relaxed),
        }
    }
}

// ── The store ──────────────────────────────────────────────────────────────

/// Outcome of one insert attempt (private to the retry driver).
enum Attempt {
    Done,
    /// A CAS would violate the downward chain invariant; re-drive locally.
    RetryNow,
    /// A referenced record's version exceeded the session's during the
    /// prepare phase; refresh and re-drive.
    VersionShift,
}

struct CasHelper {
    slot: usize,
    expected: u64,
    tag: u16,
}

/// Log-structured secondary KV for one predicate group.
pub struct SecondaryStore<K: IndexKey> {
    accessor: KeyAccessor<K>,
    comparer: Box<dyn KeyComparer<K>>,
    table: HashTable,
    log: HybridLog,
    pool: Arc<BufferPool>,
    version: AtomicU32,
    phase: AtomicU8,
    stats: StoreStats,
}

impl<K: IndexKey> SecondaryStore<K> {
    pub fn new(
        settings: &RegistrationSettings,
        device: SharedDevice,
        comparer: Box<dyn KeyComparer<K>>,
        predicate_count: usize,
    ) -> Result<Self> {
        settings.validate()?;
        let accessor = KeyAccessor::<K>::new(predicate_count)?;
        if accessor.record_size() > settings.log.page_size() as u64 {
            return Err(ChaindexError::InvalidArgument(format!(
                "record of {} bytes does not fit a {}-byte page",
                accessor.record_size(),
                settings.log.page_size()
            )));
        }
        Ok(SecondaryStore {
            accessor,
            comparer,
            table: HashTable::new(settings.hash_table_size),
            log: HybridLog::new(&settings.log, device),
            pool: BufferPool::new(accessor.record_size() as usize),
            version: AtomicU32::new(1),
            phase: AtomicU8::new(Phase::Rest.as_u8()),
            stats: StoreStats::default(),
        })
    }

    pub fn accessor(&self) -> &KeyAccessor<K> {
        &self.accessor
    }

    pub fn new_session(&self) -> StoreSession {
        StoreSession {
            serial: 0,
            version: self.version.load(Ordering::Acquire),
            phase: Phase::from_u8(self.phase.load(Ordering::Acquire)),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Chain hash for (`ordinal`, `key`) under this store's comparer.
    pub fn chain_hash(&self, ordinal: u8, key: &K) -> u64 {
        self.accessor.chain_hash(&*self.comparer, ordinal, key)
    }

    /// Key equality under this store's comparer.
    pub fn keys_equal(&self, a: &K, b: &K) -> bool {
        self.comparer.equals(a, b)
    }

    // ── Insert ───────────────────────────────────────────────────────────

    /// Insert one composite record for `record_id`, splicing every non-null
    /// KeyPointer into its chain. Retries locally on chain contention and
    /// refreshes the session across a checkpoint pivot; never suspends.
    pub fn insert(
        &self,
        session: &mut StoreSession,
        composite: &[KeyPointer<K>],
        record_id: RecordId,
    ) -> Result<()> {
        debug_assert_eq!(composite.len(), usize::from(self.accessor.predicate_count()));
        session.next_serial();
        let backoff = Backoff::new();
        for _ in 0..MAX_INSERT_ATTEMPTS {
            match self.try_insert(session, composite, record_id)? {
                Attempt::Done => return Ok(()),
                Attempt::RetryNow => {
                    self.stats.insert_retries.fetch_add(1, Ordering::Relaxed);
                    backoff.spin();
                }
                Attempt::VersionShift => {
                    self.stats.version_shifts.fetch_add(1, Ordering::Relaxed);
                    session.refresh(self);
                }
            }
        }
        Err(ChaindexError::Internal(format!(
            "insert for {record_id} did not converge after {MAX_INSERT_ATTEMPTS} attempts"
        )))
    }

    fn try_insert(
        &self,
        session: &StoreSession,
        composite: &[KeyPointer<K>],
        record_id: RecordId,
    ) -> Result<Attempt> {
        let n = usize::from(self.accessor.predicate_count());
        let mut helpers: Vec<Option<CasHelper>> = Vec::with_capacity(n);
        let mut pivot = false;
        let mut live_slots = 0u32;
        let mut dead_slots = 0u32;

        // Link-up pass: snapshot each chain head into the input composite.
        for (i, kp) in composite.iter().enumerate() {
            let ordinal = i as u8;
            kp.set_previous_address(Address::INVALID);
            if kp.is_null() {
                helpers.push(None);
                continue;
            }
            if kp.is_deleted() {
                dead_slots += 1;
            } else {
                live_slots += 1;
            }
            let Some(key) = kp.key() else {
                return Err(ChaindexError::Internal(format!(
                    "non-null key pointer without a key at ordinal {ordinal}"
                )));
            };
            let hash = self.accessor.chain_hash(&*self.comparer, ordinal, key);
            let (slot, entry) = self.table.find_or_create_tag(hash)?;

            let mut chain_prev = entry_address(entry);
            if chain_prev.is_valid() {
                if let Some(head_ptr) = self.log.get(chain_prev) {
                    // SAFETY: head_ptr is a live in-memory KeyPointer address
                    // published through this chain.
                    let head_kp = unsafe { KeyPointer::<K>::from_ptr(head_ptr) };
                    let rec_addr = self
                        .accessor
                        .record_address_from_key_pointer(chain_prev, head_kp);
                    if let Some(rec_ptr) = self.log.get(rec_addr) {
                        // SAFETY: record start within the same page as its
                        // KeyPointer; live in-memory record.
                        let header = unsafe { RecordHeader::from_ptr(rec_ptr) };
                        if header.is_tombstone()
                            && !head_kp.previous_address().is_valid()
                            && !header.is_invalid()
                        {
                            // Dead head with nothing below it: splice it out.
                            chain_prev = Address::INVALID;
                            self.stats.elided_heads.fetch_add(1, Ordering::Relaxed);
                        } else if header.version() > session.version
                            && session.phase == Phase::Prepare
                        {
                            // Kept snapshot: its version feeds pivot
                            // detection.
                            pivot = true;
                        }
                    }
                }
            }
            kp.set_previous_address(chain_prev);
            helpers.push(Some(CasHelper {
                slot,
                expected: entry,
                tag: entry_tag(entry),
            }));
        }

        if pivot {
            return Ok(Attempt::VersionShift);
        }

        // Allocate and shallow-copy; the record is born invalid.
        let record_addr = self.log.allocate(self.accessor.record_size())?;
        let rec_ptr = self
            .log
            .get(record_addr)
            .ok_or_else(|| ChaindexError::Internal("fresh allocation not in memory".into()))?;
        let tombstone = live_slots == 0 && dead_slots > 0;
        // SAFETY: rec_ptr addresses record_size() freshly allocated bytes.
        let header = unsafe { RecordHeader::from_ptr(rec_ptr) };
        header.initialize(self.version.load(Ordering::Acquire), tombstone);
        for (i, kp) in composite.iter().enumerate() {
            // SAFETY: destination lies within the fresh allocation.
            unsafe {
                kp.copy_to(rec_ptr.add((RECORD_HEADER_SIZE + i as u64 * self.accessor.entry_size()) as usize));
            }
        }
        // SAFETY: RecordId slot is 8-aligned within the fresh allocation.
        unsafe {
            std::ptr::write(
                rec_ptr.add(self.accessor.record_id_offset() as usize) as *mut u64,
                record_id.raw(),
            );
        }

        // Publish pass: splice every non-null KeyPointer.
        let first_kp_ptr = unsafe { rec_ptr.add(RECORD_HEADER_SIZE as usize) };
        for (i, helper) in helpers.iter().enumerate() {
            let Some(helper) = helper else { continue };
            let kp_addr = self.accessor.key_pointer_address(record_addr, i as u8);
            let new_entry = pack_entry(helper.tag, kp_addr);
            let mut expected = helper.expected;
            loop {
                let actual = self.table.cas(helper.slot, expected, new_entry);
                if actual == expected {
                    break;
                }
                if entry_address(actual) < kp_addr {
                    // Another writer landed below us; adopt it and re-splice.
                    // SAFETY: i is within the composite run of the record we
                    // just wrote.
                    let log_kp = unsafe { self.accessor.key_pointer_at(first_kp_ptr, i as u8) };
                    log_kp.set_previous_address(entry_address(actual));
                    expected = actual;
                    self.stats.cas_adoptions.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                // The head moved above our allocation: the downward
                // invariant is unsatisfiable for this attempt. Abandon the
                // (still invalid) record.
                trace!(
                    ordinal = i,
                    record = %record_addr,
                    "chain head overtook allocation; retrying insert"
                );
                return Ok(Attempt::RetryNow);
            }
        }

        // Finalize: scrub update-routing flags, then publish.
        for i in 0..n {
            // SAFETY: within the composite run.
            let log_kp = unsafe { self.accessor.key_pointer_at(first_kp_ptr, i as u8) };
            log_kp.clear_update_flags();
        }
        header.clear_invalid();
        if tombstone {
            self.stats.tombstone_inserts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Attempt::Done)
    }

    // ── Read ─────────────────────────────────────────────────────────────

    /// Walk the chain for `query`, starting at the hash-table head or at an
    /// explicit continuation address.
    pub fn read_chain(
        &self,
        session: &mut StoreSession,
        query: &QueryKey<K>,
        start: Option<Address>,
    ) -> Result<ChainRead<K>> {
        let serial = session.next_serial();
        self.stats.chain_reads.fetch_add(1, Ordering::Relaxed);
        let addr = match start {
            Some(a) => a,
            None => match self.table.find_tag(query.hash) {
                Some((_, entry)) => entry_address(entry),
                None => return Ok(ChainRead::NotFound),
            },
        };
        self.walk(query, addr, serial)
    }

    fn walk(&self, query: &QueryKey<K>, mut addr: Address, serial: u64) -> Result<ChainRead<K>> {
        loop {
            if !addr.is_valid() || addr < self.log.begin_address() {
                return Ok(ChainRead::NotFound);
            }
            let region = self.log.region(addr);
            let Some(kp_ptr) = self.log.get(addr) else {
                return Ok(self.suspend(query, addr, serial));
            };
            // SAFETY: in-memory chain address published by an insert.
            let kp = unsafe { KeyPointer::<K>::from_ptr(kp_ptr) };
            let rec_addr = self.accessor.record_address_from_key_pointer(addr, kp);
            let Some(rec_ptr) = self.log.get(rec_addr) else {
                return Ok(self.suspend(query, addr, serial));
            };
            // SAFETY: record header shares the KeyPointer's page.
            let header = unsafe { RecordHeader::from_ptr(rec_ptr) };
            if !header.is_invalid()
                && self
                    .accessor
                    .matches(&*self.comparer, kp, query.ordinal, &query.key)
            {
                // SAFETY: RecordId slot within the record; the invalid-bit
                // acquire above ordered its initialization before us.
                let rid = unsafe {
                    std::ptr::read(rec_ptr.add(self.accessor.record_id_offset() as usize)
                        as *const u64)
                };
                let via = match region {
                    Region::Mutable => ReaderKind::Concurrent,
                    Region::ReadOnlyInMemory => ReaderKind::Single,
                    Region::Disk => ReaderKind::Disk,
                };
                return Ok(ChainRead::Found {
                    record_id: RecordId::new(rid),
                    deleted: kp.is_deleted() || header.is_tombstone(),
                    next: kp.previous_address(),
                    via,
                });
            }
            addr = kp.previous_address();
        }
    }

    fn suspend(&self, query: &QueryKey<K>, addr: Address, serial: u64) -> ChainRead<K> {
        self.stats.pending_reads.fetch_add(1, Ordering::Relaxed);
        let mut buffer = self.pool.acquire();
        // Park the key bytes in the aligned buffer; the walk's stack is gone
        // once the caller sees Pending.
        let key_bytes = std::mem::size_of::<K>().min(buffer.len());
        // SAFETY: K is plain data (IndexKey) and fits the pooled buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &query.key as *const K as *const u8,
                buffer.as_mut_ptr(),
                key_bytes,
            );
        }
        ChainRead::Pending(PendingRead {
            query: *query,
            resume: addr,
            serial,
            buffer,
        })
    }

    /// Complete a suspended chain walk with device reads, re-entering the
    /// in-memory walk if the chain climbs back above `head`.
    pub fn complete_read(&self, mut pending: PendingRead<K>) -> Result<ChainRead<K>> {
        let mut addr = pending.resume;
        let kp_size = self.accessor.entry_size() as usize;
        loop {
            if !addr.is_valid() || addr < self.log.begin_address() {
                return Ok(ChainRead::NotFound);
            }
            if self.log.get(addr).is_some() {
                return self.walk(&pending.query, addr, pending.serial);
            }

            // First read: just the KeyPointer, to learn the record start.
            self.log
                .read_from_device(addr, &mut pending.buffer[..kp_size])?;
            // SAFETY: the buffer is sector-aligned and holds a flushed
            // KeyPointer image.
            let kp = unsafe { KeyPointer::<K>::from_ptr(pending.buffer.as_mut_ptr()) };
            let rec_addr = self.accessor.record_address_from_key_pointer(addr, kp);
            let offset_in_record = (addr.offset() - rec_addr.offset()) as usize;

            // Second read: the whole record.
            let rec_size = self.accessor.record_size() as usize;
            self.log
                .read_from_device(rec_addr, &mut pending.buffer[..rec_size])?;
            let buf_ptr = pending.buffer.as_mut_ptr();
            // SAFETY: buffer now holds the full record image.
            let header = unsafe { RecordHeader::from_ptr(buf_ptr) };
            // SAFETY: the matched KeyPointer sits at its in-record offset.
            let kp = unsafe { KeyPointer::<K>::from_ptr(buf_ptr.add(offset_in_record)) };
            if !header.is_invalid()
                && self.accessor.matches(
                    &*self.comparer,
                    kp,
                    pending.query.ordinal,
                    &pending.query.key,
                )
            {
                // SAFETY: RecordId slot within the buffered record image.
                let rid = unsafe {
                    std::ptr::read(buf_ptr.add(self.accessor.record_id_offset() as usize)
                        as *const u64)
                };
                return Ok(ChainRead::Found {
                    record_id: RecordId::new(rid),
                    deleted: kp.is_deleted() || header.is_tombstone(),
                    next: kp.previous_address(),
                    via: ReaderKind::Disk,
                });
            }
            addr = kp.previous_address();
        }
    }

    // ── Checkpoint substrate ─────────────────────────────────────────────

    pub fn current_version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn current_phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Enter the prepare phase of a checkpoint.
    pub(crate) fn enter_prepare(&self) {
        self.phase.store(Phase::Prepare.as_u8(), Ordering::Release);
    }

    /// Pivot: bump the version and move to in-progress. Sessions still at
    /// the old version observe the shift and refresh.
    pub(crate) fn pivot_version(&self) -> u32 {
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.phase
            .store(Phase::InProgress.as_u8(), Ordering::Release);
        v
    }

    pub(crate) fn enter_wait_flush(&self) {
        self.phase
            .store(Phase::WaitFlush.as_u8(), Ordering::Release);
    }

    pub(crate) fn finish_checkpoint(&self) {
        self.phase.store(Phase::Rest.as_u8(), Ordering::Release);
    }

    pub(crate) fn restore_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
        self.phase.store(Phase::Rest.as_u8(), Ordering::Release);
    }

    pub(crate) fn table(&self) -> &HashTable {
        &self.table
    }

    pub(crate) fn log(&self) -> &HybridLog {
        &self.log
    }

    /// Flush the log through the tail.
    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    /// Flush and evict every page; subsequent reads suspend.
    pub fn flush_and_evict(&self) -> Result<()> {
        self.log.flush_and_evict()
    }

    /// Drop page memory entirely. Exclusive access required.
    pub fn dispose_from_memory(&mut self) -> Result<()> {
        self.log.dispose_from_memory()
    }

    /// Diagnostic sweep used by invariant tests: walk a whole chain and
    /// check the downward invariant, returning the addresses visited.
    pub fn chain_addresses(&self, hash: u64) -> Result<Vec<Address>> {
        let mut out = Vec::new();
        let Some((_, entry)) = self.table.find_tag(hash) else {
            return Ok(out);
        };
        let mut addr = entry_address(entry);
        while addr.is_valid() && addr >= self.log.begin_address() {
            let Some(kp_ptr) = self.log.get(addr) else {
                warn!(addr = %addr, "chain sweep stopped at evicted page");
                break;
            };
            if let Some(last) = out.last()
                && addr >= *last
            {
                return Err(ChaindexError::Internal(format!(
                    "chain order violation: {addr} after {last}"
                )));
            }
            out.push(addr);
            // SAFETY: live in-memory chain address.
            let kp = unsafe { KeyPointer::<K>::from_ptr(kp_ptr) };
            addr = kp.previous_address();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogSettings;
    use crate::device::InMemoryDevice;
    use crate::hash::Xxh64Comparer;

    fn test_store(predicates: usize) -> SecondaryStore<u64> {
        let settings = RegistrationSettings {
            hash_table_size: 1 << 8,
            log: LogSettings {
                memory_bits: 16,
                segment_bits: 16,
                page_bits: 10,
                read_cache: None,
            },
            ..RegistrationSettings::default()
        };
        SecondaryStore::new(
            &settings,
            Arc::new(InMemoryDevice::new()),
            Box::new(Xxh64Comparer),
            predicates,
        )
        .unwrap()
    }

    fn composite_of(
        store: &SecondaryStore<u64>,
        keys: &[Option<u64>],
        role: KeyRole,
    ) -> Vec<KeyPointer<u64>> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| {
                KeyPointer::build(
                    i as u8,
                    store.accessor().offset_to_start(i as u8),
                    *k,
                    if k.is_some() { role } else { KeyRole::Null },
                )
            })
            .collect()
    }

    fn query(store: &SecondaryStore<u64>, ordinal: u8, key: u64) -> QueryKey<u64> {
        QueryKey {
            ordinal,
            key,
            hash: store.chain_hash(ordinal, &key),
        }
    }

    fn collect_chain(
        store: &SecondaryStore<u64>,
        session: &mut StoreSession,
        ordinal: u8,
        key: u64,
    ) -> Vec<(RecordId, bool)> {
        let q = query(store, ordinal, key);
        let mut out = Vec::new();
        let mut start = None;
        loop {
            let step = store.read_chain(session, &q, start).unwrap();
            match step {
                ChainRead::Found {
                    record_id,
                    deleted,
                    next,
                    ..
                } => {
                    out.push((record_id, deleted));
                    start = Some(next);
                }
                ChainRead::NotFound => return out,
                ChainRead::Pending(p) => match store.complete_read(p).unwrap() {
                    ChainRead::Found {
                        record_id,
                        deleted,
                        next,
                        ..
                    } => {
                        out.push((record_id, deleted));
                        start = Some(next);
                    }
                    ChainRead::NotFound => return out,
                    ChainRead::Pending(_) => panic!("pending after completion"),
                },
            }
        }
    }

    #[test]
    fn test_insert_then_read_single_predicate() {
        let store = test_store(1);
        let mut s = store.new_session();
        let c = composite_of(&store, &[Some(42)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(10)).unwrap();

        let hits = collect_chain(&store, &mut s, 0, 42);
        assert_eq!(hits, vec![(RecordId::new(10), false)]);
        assert!(collect_chain(&store, &mut s, 0, 43).is_empty());
    }

    #[test]
    fn test_chain_accumulates_newest_first() {
        let store = test_store(1);
        let mut s = store.new_session();
        for rid in 1..=5u64 {
            let c = composite_of(&store, &[Some(7)], KeyRole::Link);
            store.insert(&mut s, &c, RecordId::new(rid)).unwrap();
        }
        let rids: Vec<u64> = collect_chain(&store, &mut s, 0, 7)
            .into_iter()
            .map(|(r, _)| r.raw())
            .collect();
        assert_eq!(rids, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_multi_predicate_record_links_n_chains() {
        let store = test_store(3);
        let mut s = store.new_session();
        let c = composite_of(&store, &[Some(1), Some(2), Some(3)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(99)).unwrap();

        for (ordinal, key) in [(0u8, 1u64), (1, 2), (2, 3)] {
            let hits = collect_chain(&store, &mut s, ordinal, key);
            assert_eq!(hits, vec![(RecordId::new(99), false)], "ordinal {ordinal}");
        }
        // Key under the wrong predicate finds nothing.
        assert!(collect_chain(&store, &mut s, 0, 2).is_empty());
    }

    #[test]
    fn test_null_slot_joins_no_chain() {
        let store = test_store(2);
        let mut s = store.new_session();
        let c = composite_of(&store, &[Some(5), None], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(1)).unwrap();

        assert_eq!(collect_chain(&store, &mut s, 0, 5).len(), 1);
        assert!(collect_chain(&store, &mut s, 1, 0).is_empty());
    }

    #[test]
    fn test_delete_links_tombstone() {
        let store = test_store(1);
        let mut s = store.new_session();
        let c = composite_of(&store, &[Some(9)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(4)).unwrap();
        let d = composite_of(&store, &[Some(9)], KeyRole::Delete);
        store.insert(&mut s, &d, RecordId::new(4)).unwrap();

        let hits = collect_chain(&store, &mut s, 0, 9);
        assert_eq!(
            hits,
            vec![(RecordId::new(4), true), (RecordId::new(4), false)]
        );
        assert_eq!(store.stats().tombstone_inserts, 1);
    }

    #[test]
    fn test_tombstone_head_is_elided_by_next_insert() {
        let store = test_store(1);
        let mut s = store.new_session();
        // Delete-first: tombstone becomes the chain head with no successor.
        let d = composite_of(&store, &[Some(3)], KeyRole::Delete);
        store.insert(&mut s, &d, RecordId::new(1)).unwrap();
        // The next insert elides it.
        let c = composite_of(&store, &[Some(3)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(2)).unwrap();

        let hits = collect_chain(&store, &mut s, 0, 3);
        assert_eq!(hits, vec![(RecordId::new(2), false)]);
        assert_eq!(store.stats().elided_heads, 1);
    }

    #[test]
    fn test_read_after_evict_goes_pending_and_completes() {
        let store = test_store(2);
        let mut s = store.new_session();
        let c = composite_of(&store, &[Some(11), Some(22)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(77)).unwrap();
        store.flush_and_evict().unwrap();

        let q = query(&store, 1, 22);
        let outcome = store.read_chain(&mut s, &q, None).unwrap();
        let ChainRead::Pending(p) = outcome else {
            panic!("expected pending read after evict");
        };
        assert!(p.serial() > 0);
        assert!(p.resume_address().is_valid());
        match store.complete_read(p).unwrap() {
            ChainRead::Found {
                record_id,
                deleted,
                via,
                ..
            } => {
                assert_eq!(record_id, RecordId::new(77));
                assert!(!deleted);
                assert_eq!(via, ReaderKind::Disk);
            }
            _ => panic!("completion must find the record"),
        }
        assert_eq!(store.stats().pending_reads, 1);
    }

    #[test]
    fn test_chain_walk_spanning_memory_and_disk() {
        let store = test_store(1);
        let mut s = store.new_session();
        let c = composite_of(&store, &[Some(6)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(1)).unwrap();
        store.flush_and_evict().unwrap();
        let c = composite_of(&store, &[Some(6)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(2)).unwrap();

        let rids: Vec<u64> = collect_chain(&store, &mut s, 0, 6)
            .into_iter()
            .map(|(r, _)| r.raw())
            .collect();
        assert_eq!(rids, vec![2, 1]);
    }

    #[test]
    fn test_downward_invariant_on_chain_sweep() {
        let store = test_store(1);
        let mut s = store.new_session();
        for rid in 1..=20u64 {
            let c = composite_of(&store, &[Some(1)], KeyRole::Link);
            store.insert(&mut s, &c, RecordId::new(rid)).unwrap();
        }
        let addrs = store.chain_addresses(store.chain_hash(0, &1)).unwrap();
        assert_eq!(addrs.len(), 20);
        assert!(addrs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_version_shift_retries_and_lands_in_new_version() {
        let store = test_store(1);
        let mut stale = store.new_session();
        // A checkpoint pivot happens while `stale` still holds the old view.
        store.enter_prepare();
        stale.phase = Phase::Prepare;
        let v = store.pivot_version();
        // Another session writes a record in the new version.
        let mut fresh = store.new_session();
        let c = composite_of(&store, &[Some(8)], KeyRole::Link);
        store.insert(&mut fresh, &c, RecordId::new(1)).unwrap();

        // The stale session now links against the v+1 head; the shift is
        // detected and absorbed by refreshing.
        let c = composite_of(&store, &[Some(8)], KeyRole::Link);
        store.insert(&mut stale, &c, RecordId::new(2)).unwrap();
        store.finish_checkpoint();

        assert_eq!(store.stats().version_shifts, 1);
        assert_eq!(stale.version(), v);
        let rids: Vec<u64> = collect_chain(&store, &mut fresh, 0, 8)
            .into_iter()
            .map(|(r, _)| r.raw())
            .collect();
        assert_eq!(rids, vec![2, 1]);
    }

    #[test]
    fn test_elidable_head_skips_pivot_detection() {
        let store = test_store(1);
        let mut stale = store.new_session();
        store.enter_prepare();
        stale.phase = Phase::Prepare;
        store.pivot_version();

        // A newer-version tombstone with nothing below it sits at the head.
        let mut fresh = store.new_session();
        let d = composite_of(&store, &[Some(4)], KeyRole::Delete);
        store.insert(&mut fresh, &d, RecordId::new(1)).unwrap();

        // The stale prepare-phase session elides it instead of pivoting.
        let c = composite_of(&store, &[Some(4)], KeyRole::Link);
        store.insert(&mut stale, &c, RecordId::new(2)).unwrap();
        store.finish_checkpoint();

        assert_eq!(store.stats().elided_heads, 1);
        assert_eq!(store.stats().version_shifts, 0);
        let hits = collect_chain(&store, &mut fresh, 0, 4);
        assert_eq!(hits, vec![(RecordId::new(2), false)]);
    }

    #[test]
    fn test_concurrent_inserts_one_chain() {
        let store = Arc::new(test_store(1));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut s = store.new_session();
                for i in 0..50u64 {
                    let c: Vec<KeyPointer<u64>> = vec![KeyPointer::build(
                        0,
                        0,
                        Some(123),
                        KeyRole::Link,
                    )];
                    store
                        .insert(&mut s, &c, RecordId::new(t * 1000 + i + 1))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut s = store.new_session();
        let hits = collect_chain(&store, &mut s, 0, 123);
        assert_eq!(hits.len(), 200);
        // Every inserted id present exactly once.
        let mut rids: Vec<u64> = hits.iter().map(|(r, _)| r.raw()).collect();
        rids.sort_unstable();
        rids.dedup();
        assert_eq!(rids.len(), 200);
        // And the chain is strictly downward.
        let addrs = store.chain_addresses(store.chain_hash(0, &123)).unwrap();
        assert!(addrs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_serials_strictly_increase() {
        let store = test_store(1);
        let mut s = store.new_session();
        let c = composite_of(&store, &[Some(1)], KeyRole::Link);
        store.insert(&mut s, &c, RecordId::new(1)).unwrap();
        let after_insert = s.serial();
        let q = query(&store, 0, 1);
        let _ = store.read_chain(&mut s, &q, None).unwrap();
        assert!(s.serial() > after_insert);
    }
}
