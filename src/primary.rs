//! The primary-store contract, and a reference implementation.
//!
//! chaindex never owns the primary records it indexes; it talks to the
//! primary KV through [`PrimaryStore`]: address-based reads for surfacing
//! query results, and hash-chain walks for the query-side liveness check.
//! The index is attached to a primary at construction
//! ([`IndexManager::attach`](crate::manager::IndexManager::attach)); there is
//! no process-wide registry.
//!
//! [`LogPrimary`] is a compact log-structured primary: an append-only record
//! log with per-key chains, in-place updates for values that stay in the
//! mutable region, and an optional read-cache promotion used to exercise the
//! cache-skipping walk. It backs the test suites and the bench driver.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::addr::{Address, RecordId};

/// One step of a primary hash chain.
#[derive(Debug, Clone)]
pub struct PrimaryChainEntry<K> {
    pub key: K,
    pub previous: Address,
    /// The entry is a delete marker for its key.
    pub tombstone: bool,
}

/// Contract the index requires of the primary KV.
pub trait PrimaryStore: Send + Sync + 'static {
    type UserKey: Clone + Eq + Hash + Send + Sync + 'static;
    type UserValue: Clone + Send + Sync + 'static;

    /// Address-based read of a prior record. `None` when the address has
    /// been truncated away or holds a delete marker.
    fn read_at(&self, record_id: RecordId) -> Option<(Self::UserKey, Self::UserValue)>;

    /// Highest address in the hash chain for `key` (read-cache entries
    /// included), or `Address::INVALID` when the key has no chain.
    fn chain_head(&self, key: &Self::UserKey) -> Address;

    /// The chain entry at `addr`.
    fn chain_entry(&self, addr: Address) -> Option<PrimaryChainEntry<Self::UserKey>>;

    /// Whether `addr` names a read-cache copy rather than a log record.
    fn is_read_cache_address(&self, addr: Address) -> bool;
}

// ── Liveness session ───────────────────────────────────────────────────────

/// Per-flow handle on the primary store, owned by an
/// [`IndexSession`](crate::session::IndexSession) alongside its per-group
/// store sessions. Query results are resolved through it: a RecordId is
/// surfaced only if the primary's chain for its user key still resolves to
/// that RecordId. Single-owner, like every session.
#[derive(Debug, Default)]
pub struct LivenessSession {
    checks: u64,
    stale_drops: u64,
}

impl LivenessSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Liveness checks performed on this session.
    pub fn checks(&self) -> u64 {
        self.checks
    }

    /// Checks that found the record superseded, deleted, or truncated.
    pub fn stale_drops(&self) -> u64 {
        self.stale_drops
    }

    /// Whether the primary's chain for `key` still resolves to `rid` at its
    /// highest non-read-cache address.
    ///
    /// Walks from the chain head following `previous_address` links,
    /// skipping read-cache entries. Chain addresses decrease monotonically,
    /// so reaching an address below `rid` without a match means the record
    /// is stale; an entry for `key` above `rid` means a newer version
    /// superseded it.
    pub fn is_live<P: PrimaryStore>(
        &mut self,
        primary: &P,
        key: &P::UserKey,
        rid: RecordId,
    ) -> bool {
        self.checks += 1;
        let live = Self::resolve(primary, key, rid);
        if !live {
            self.stale_drops += 1;
        }
        live
    }

    fn resolve<P: PrimaryStore>(primary: &P, key: &P::UserKey, rid: RecordId) -> bool {
        let target = rid.as_address();
        let mut addr = primary.chain_head(key);
        while addr.is_valid() {
            if primary.is_read_cache_address(addr) {
                match primary.chain_entry(addr) {
                    Some(e) => addr = e.previous,
                    None => return false,
                }
                continue;
            }
            if addr < target {
                return false;
            }
            let Some(entry) = primary.chain_entry(addr) else {
                return false;
            };
            if addr == target {
                return !entry.tombstone;
            }
            if entry.key == *key {
                return false;
            }
            addr = entry.previous;
        }
        false
    }
}

// ── Reference implementation ───────────────────────────────────────────────

struct PrimaryRecord<K, V> {
    key: K,
    /// `None` marks a delete.
    value: Option<V>,
    previous: Address,
    read_cache: bool,
}

struct PrimaryInner<K, V> {
    records: Vec<PrimaryRecord<K, V>>,
    heads: HashMap<K, Address>,
}

/// Append-only, hash-chained primary KV.
pub struct LogPrimary<K, V> {
    inner: Mutex<PrimaryInner<K, V>>,
}

impl<K, V> Default for LogPrimary<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LogPrimary<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        LogPrimary {
            inner: Mutex::new(PrimaryInner {
                records: Vec::new(),
                heads: HashMap::new(),
            }),
        }
    }

    fn address_of(index: usize) -> Address {
        Address::new(index as u64 + 1)
    }

    fn index_of(addr: Address) -> Option<usize> {
        addr.is_valid().then(|| (addr.offset() - 1) as usize)
    }

    fn append(
        inner: &mut PrimaryInner<K, V>,
        key: K,
        value: Option<V>,
        read_cache: bool,
    ) -> Address {
        let previous = inner.heads.get(&key).copied().unwrap_or(Address::INVALID);
        let addr = Self::address_of(inner.records.len());
        inner.heads.insert(key.clone(), addr);
        inner.records.push(PrimaryRecord {
            key,
            value,
            previous,
            read_cache,
        });
        addr
    }

    /// Append a new version of `key`, returning its RecordId.
    pub fn upsert(&self, key: K, value: V) -> RecordId {
        let mut inner = self.inner.lock();
        RecordId::from(Self::append(&mut inner, key, Some(value), false))
    }

    /// Overwrite the current value of `key` in place, keeping its RecordId.
    /// Returns `None` when the key is absent or deleted.
    pub fn update_in_place(&self, key: &K, value: V) -> Option<RecordId> {
        let mut inner = self.inner.lock();
        let head = inner.heads.get(key).copied()?;
        let idx = Self::index_of(head)?;
        let rec = &mut inner.records[idx];
        rec.value.as_ref()?;
        rec.value = Some(value);
        Some(RecordId::from(head))
    }

    /// Append a delete marker for `key`. Returns the RecordId of the record
    /// that was current before the delete, if any.
    pub fn delete(&self, key: &K) -> Option<RecordId> {
        let mut inner = self.inner.lock();
        let head = inner.heads.get(key).copied()?;
        let idx = Self::index_of(head)?;
        if inner.records[idx].value.is_none() {
            return None; // already deleted
        }
        Self::append(&mut inner, key.clone(), None, false);
        Some(RecordId::from(head))
    }

    /// Current value of `key` with its RecordId.
    pub fn read(&self, key: &K) -> Option<(RecordId, V)> {
        let inner = self.inner.lock();
        let mut addr = inner.heads.get(key).copied()?;
        while let Some(idx) = Self::index_of(addr) {
            let rec = &inner.records[idx];
            if !rec.read_cache {
                return rec.value.clone().map(|v| (RecordId::from(addr), v));
            }
            addr = rec.previous;
        }
        None
    }

    /// Install a read-cache copy of the key's current value at the chain
    /// head. Liveness walks must skip it.
    pub fn promote_to_read_cache(&self, key: &K) -> Option<Address> {
        let mut inner = self.inner.lock();
        let head = inner.heads.get(key).copied()?;
        let idx = Self::index_of(head)?;
        let value = inner.records[idx].value.clone()?;
        Some(Self::append(&mut inner, key.clone(), Some(value), true))
    }

    /// Number of log records (including delete markers and cache copies).
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> PrimaryStore for LogPrimary<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type UserKey = K;
    type UserValue = V;

    fn read_at(&self, record_id: RecordId) -> Option<(K, V)> {
        let inner = self.inner.lock();
        let idx = Self::index_of(record_id.as_address())?;
        let rec = inner.records.get(idx)?;
        rec.value.clone().map(|v| (rec.key.clone(), v))
    }

    fn chain_head(&self, key: &K) -> Address {
        self.inner
            .lock()
            .heads
            .get(key)
            .copied()
            .unwrap_or(Address::INVALID)
    }

    fn chain_entry(&self, addr: Address) -> Option<PrimaryChainEntry<K>> {
        let inner = self.inner.lock();
        let idx = Self::index_of(addr)?;
        let rec = inner.records.get(idx)?;
        Some(PrimaryChainEntry {
            key: rec.key.clone(),
            previous: rec.previous,
            tombstone: rec.value.is_none(),
        })
    }

    fn is_read_cache_address(&self, addr: Address) -> bool {
        let inner = self.inner.lock();
        Self::index_of(addr)
            .and_then(|idx| inner.records.get(idx))
            .is_some_and(|rec| rec.read_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_read() {
        let p = LogPrimary::<String, u64>::new();
        let r1 = p.upsert("a".into(), 1);
        assert_eq!(p.read(&"a".into()), Some((r1, 1)));

        let r2 = p.upsert("a".into(), 2);
        assert!(r2 > r1);
        assert_eq!(p.read(&"a".into()), Some((r2, 2)));
        // Address-based read of the older version still works.
        assert_eq!(p.read_at(r1), Some(("a".into(), 1)));
    }

    #[test]
    fn test_chain_walk_reaches_older_versions() {
        let p = LogPrimary::<u32, u32>::new();
        let r1 = p.upsert(5, 10);
        let r2 = p.upsert(5, 20);

        let head = p.chain_head(&5);
        assert_eq!(head, r2.as_address());
        let e = p.chain_entry(head).unwrap();
        assert_eq!(e.previous, r1.as_address());
        let e = p.chain_entry(e.previous).unwrap();
        assert_eq!(e.previous, Address::INVALID);
    }

    #[test]
    fn test_update_in_place_keeps_record_id() {
        let p = LogPrimary::<u32, u32>::new();
        let r1 = p.upsert(1, 100);
        assert_eq!(p.update_in_place(&1, 200), Some(r1));
        assert_eq!(p.read(&1), Some((r1, 200)));
        assert_eq!(p.update_in_place(&2, 1), None);
    }

    #[test]
    fn test_delete_appends_marker() {
        let p = LogPrimary::<u32, u32>::new();
        assert!(p.is_empty());
        let r1 = p.upsert(1, 100);
        assert_eq!(p.delete(&1), Some(r1));
        assert_eq!(p.len(), 2, "the marker is a log record too");
        assert_eq!(p.read(&1), None);
        assert_eq!(p.read_at(r1), Some((1, 100)), "log is immutable");
        // Chain head is now the marker.
        let e = p.chain_entry(p.chain_head(&1)).unwrap();
        assert!(e.tombstone);
        // Double delete is a no-op.
        assert_eq!(p.delete(&1), None);
    }

    #[test]
    fn test_read_cache_promotion() {
        let p = LogPrimary::<u32, u32>::new();
        let r1 = p.upsert(9, 90);
        let cache_addr = p.promote_to_read_cache(&9).unwrap();
        assert!(p.is_read_cache_address(cache_addr));
        assert!(!p.is_read_cache_address(r1.as_address()));
        // Reads resolve through the cache entry to the same value.
        assert_eq!(p.read(&9), Some((r1, 90)));
        assert_eq!(p.chain_head(&9), cache_addr);
    }

    #[test]
    fn test_liveness_current_record() {
        let p = LogPrimary::<u32, u32>::new();
        let mut ls = LivenessSession::new();
        let r1 = p.upsert(1, 10);
        assert!(ls.is_live(&p, &1, r1));

        let r2 = p.upsert(1, 20);
        assert!(!ls.is_live(&p, &1, r1), "superseded record is stale");
        assert!(ls.is_live(&p, &1, r2));
        assert_eq!(ls.checks(), 3);
        assert_eq!(ls.stale_drops(), 1);
    }

    #[test]
    fn test_liveness_after_delete() {
        let p = LogPrimary::<u32, u32>::new();
        let mut ls = LivenessSession::new();
        let r1 = p.upsert(1, 10);
        p.delete(&1);
        assert!(!ls.is_live(&p, &1, r1));
        assert_eq!(ls.stale_drops(), 1);
    }

    #[test]
    fn test_liveness_skips_read_cache() {
        let p = LogPrimary::<u32, u32>::new();
        let mut ls = LivenessSession::new();
        let r1 = p.upsert(1, 10);
        p.promote_to_read_cache(&1);
        // The cache copy sits above r1 in the chain; the walk must skip it
        // and still find r1 live.
        assert!(ls.is_live(&p, &1, r1));
        assert_eq!(ls.stale_drops(), 0);
    }
}
