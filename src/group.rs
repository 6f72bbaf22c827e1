//! Predicate groups.
//!
//! A group binds an ordered set of compatible predicates (same key type) to
//! one secondary store. It owns predicate execution — including containment
//! of predicate panics — composite construction in a per-session scratch
//! buffer, and the change-tracking diff that decides, per predicate, whether
//! an update unlinks the old chain, links a new one, or does nothing.
//!
//! Lifecycle per mutation:
//!
//! | phase        | input          | effect                                    |
//! |--------------|----------------|-------------------------------------------|
//! | `insert`     | after value    | build composite; all-null is a no-op       |
//! | `pre_update` | before value   | park the before composite in the tracker   |
//! | `post_update`| after value    | diff against the parked composite; write   |
//! | `delete`     | before value   | tombstone composite at the dead RecordId   |

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::debug;

use crate::addr::RecordId;
use crate::config::RegistrationSettings;
use crate::device::SharedDevice;
use crate::error::{ChaindexError, Result};
use crate::hash::{IndexKey, KeyComparer};
use crate::query::{CancellationToken, ChainStream};
use crate::store::{KeyPointer, KeyRole, SecondaryStore, StoreSession};

/// Identifies a group within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) u32);

/// Handle to one registered predicate, returned in definition order.
#[derive(Debug, Clone)]
pub struct PredicateHandle {
    pub(crate) group: GroupId,
    pub(crate) ordinal: u8,
    name: Arc<str>,
}

impl PredicateHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }
}

/// A named predicate definition: `value -> optional predicate key`.
pub struct PredicateDef<K, V> {
    name: String,
    func: Box<dyn Fn(&V) -> Option<K> + Send + Sync>,
}

impl<K, V> PredicateDef<K, V> {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&V) -> Option<K> + Send + Sync + 'static,
    ) -> Self {
        PredicateDef {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

/// How the primary store performed the mutation driving an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Insert,
    /// In-place update: the RecordId did not change.
    Ipu,
    /// Read-copy-update: a fresh RecordId supersedes the old one.
    Rcu,
    Delete,
}

// ── Change tracker ─────────────────────────────────────────────────────────

/// Before/after composites plus the operation that connects them.
pub struct ChangeTracker<K> {
    before: Vec<Option<K>>,
    after: Vec<Option<K>>,
    before_record_id: RecordId,
    armed: bool,
}

impl<K> ChangeTracker<K> {
    fn new() -> Self {
        ChangeTracker {
            before: Vec::new(),
            after: Vec::new(),
            before_record_id: RecordId::INVALID,
            armed: false,
        }
    }

    /// RecordId whose chain entries the update leaves behind.
    pub fn before_record_id(&self) -> RecordId {
        self.before_record_id
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

/// Per-flow state for one group: the store session plus scratch buffers the
/// composite builder reuses across operations.
pub struct GroupSession<K> {
    pub(crate) store: StoreSession,
    tracker: ChangeTracker<K>,
    scratch: Vec<KeyPointer<K>>,
    roles: Vec<KeyRole>,
    keys: Vec<Option<K>>,
}

impl<K: IndexKey> GroupSession<K> {
    pub fn tracker(&self) -> &ChangeTracker<K> {
        &self.tracker
    }

    pub fn serial(&self) -> u64 {
        self.store.serial()
    }
}

// ── Group ──────────────────────────────────────────────────────────────────

/// One predicate group and its backing secondary store.
pub struct Group<K: IndexKey, V> {
    id: GroupId,
    names: Vec<Arc<str>>,
    funcs: Vec<Box<dyn Fn(&V) -> Option<K> + Send + Sync>>,
    store: SecondaryStore<K>,
}

impl<K: IndexKey, V> std::fmt::Debug for Group<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("names", &self.names)
            .field("num_predicates", &self.funcs.len())
            .finish()
    }
}

impl<K: IndexKey, V> Group<K, V> {
    pub(crate) fn new(
        id: GroupId,
        settings: &RegistrationSettings,
        device: SharedDevice,
        comparer: Box<dyn KeyComparer<K>>,
        defs: Vec<PredicateDef<K, V>>,
    ) -> Result<Self> {
        if defs.is_empty() {
            return Err(ChaindexError::InvalidArgument(
                "a group needs at least one predicate".into(),
            ));
        }
        let mut names: Vec<Arc<str>> = Vec::with_capacity(defs.len());
        let mut funcs = Vec::with_capacity(defs.len());
        for def in defs {
            if def.name.is_empty() {
                return Err(ChaindexError::InvalidArgument(
                    "predicate names must be non-empty".into(),
                ));
            }
            if names.iter().any(|n| **n == *def.name) {
                return Err(ChaindexError::InvalidArgument(format!(
                    "duplicate predicate name '{}' in group",
                    def.name
                )));
            }
            names.push(Arc::from(def.name.as_str()));
            funcs.push(def.func);
        }
        let store = SecondaryStore::new(settings, device, comparer, funcs.len())?;
        debug!(group = id.0, predicates = funcs.len(), "registered group");
        Ok(Group {
            id,
            names,
            funcs,
            store,
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn predicate_count(&self) -> usize {
        self.funcs.len()
    }

    pub(crate) fn store(&self) -> &SecondaryStore<K> {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut SecondaryStore<K> {
        &mut self.store
    }

    /// Handles for every predicate, in definition order.
    pub fn handles(&self) -> Vec<PredicateHandle> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| PredicateHandle {
                group: self.id,
                ordinal: i as u8,
                name: Arc::clone(n),
            })
            .collect()
    }

    /// Resolve a predicate by name.
    pub fn predicate(&self, name: &str) -> Result<PredicateHandle> {
        self.names
            .iter()
            .position(|n| **n == *name)
            .map(|i| PredicateHandle {
                group: self.id,
                ordinal: i as u8,
                name: Arc::clone(&self.names[i]),
            })
            .ok_or_else(|| ChaindexError::UnknownPredicate(name.to_string()))
    }

    pub fn new_session(&self) -> GroupSession<K> {
        GroupSession {
            store: self.store.new_session(),
            tracker: ChangeTracker::new(),
            scratch: Vec::with_capacity(self.funcs.len()),
            roles: Vec::with_capacity(self.funcs.len()),
            keys: Vec::with_capacity(self.funcs.len()),
        }
    }

    // ── Predicate execution ──────────────────────────────────────────────

    /// Run every predicate on `value` into `out`. A panicking predicate is
    /// an internal error; the caller poisons the session.
    fn eval_into(&self, value: &V, out: &mut Vec<Option<K>>) -> Result<()> {
        out.clear();
        for (i, f) in self.funcs.iter().enumerate() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
                Ok(key) => out.push(key),
                Err(_) => {
                    return Err(ChaindexError::Internal(format!(
                        "predicate '{}' panicked",
                        self.names[i]
                    )));
                }
            }
        }
        Ok(())
    }

    fn build_composite(&self, session: &mut GroupSession<K>) {
        session.scratch.clear();
        let accessor = self.store.accessor();
        for (i, key) in session.keys.iter().enumerate() {
            let role = session.roles[i];
            session.scratch.push(KeyPointer::build(
                i as u8,
                accessor.offset_to_start(i as u8),
                if role == KeyRole::Null { None } else { *key },
                role,
            ));
        }
    }

    // ── Lifecycle phases ─────────────────────────────────────────────────

    /// Index the after-image of a freshly inserted record.
    pub fn insert(&self, session: &mut GroupSession<K>, after: &V, record_id: RecordId) -> Result<()> {
        self.eval_into(after, &mut session.keys)?;
        if session.keys.iter().all(Option::is_none) {
            return Ok(());
        }
        session.roles.clear();
        session
            .roles
            .extend(session.keys.iter().map(|k| match k {
                Some(_) => KeyRole::Link,
                None => KeyRole::Null,
            }));
        self.build_composite(session);
        self.store.insert(&mut session.store, &session.scratch, record_id)
    }

    /// Capture the before-image composite ahead of a primary update; no
    /// store I/O happens until [`Self::post_update`].
    pub fn pre_update(
        &self,
        session: &mut GroupSession<K>,
        before: &V,
        before_record_id: RecordId,
    ) -> Result<()> {
        session.tracker.armed = false;
        let mut before_keys = std::mem::take(&mut session.tracker.before);
        self.eval_into(before, &mut before_keys)?;
        session.tracker.before = before_keys;
        session.tracker.before_record_id = before_record_id;
        session.tracker.armed = true;
        Ok(())
    }

    /// Complete an update: diff the after-image against the parked
    /// before-image and write the tombstone/live composites.
    pub fn post_update(
        &self,
        session: &mut GroupSession<K>,
        after: &V,
        new_record_id: RecordId,
        op: UpdateOp,
    ) -> Result<()> {
        if !session.tracker.armed || session.tracker.before.len() != self.funcs.len() {
            return Err(ChaindexError::InvalidOperation(
                "post_update without a parked before-image".into(),
            ));
        }
        session.tracker.armed = false;

        let mut after_keys = std::mem::take(&mut session.tracker.after);
        self.eval_into(after, &mut after_keys)?;
        session.tracker.after = after_keys;

        let n = self.funcs.len();
        let mut any_unlink = false;
        let mut any_link = false;
        session.roles.clear();
        session.roles.resize(n, KeyRole::Null);
        // Roles for the live (after) composite; unlinks are collected for
        // the tombstone composite below.
        let mut unlink_keys: Vec<Option<K>> = vec![None; n];
        for i in 0..n {
            let before = session.tracker.before[i];
            let after = session.tracker.after[i];
            match (before, after) {
                (None, None) => {}
                (None, Some(_)) => {
                    session.roles[i] = KeyRole::LinkNew;
                    any_link = true;
                }
                (Some(b), None) => {
                    unlink_keys[i] = Some(b);
                    any_unlink = true;
                }
                (Some(b), Some(a)) => {
                    if self.store.keys_equal(&b, &a) {
                        session.roles[i] = KeyRole::Link;
                    } else {
                        unlink_keys[i] = Some(b);
                        session.roles[i] = KeyRole::LinkNew;
                        any_unlink = true;
                        any_link = true;
                    }
                }
            }
        }

        let unchanged = !any_unlink && !any_link;
        let record_id_stable = session.tracker.before_record_id == new_record_id;
        if unchanged && (op == UpdateOp::Ipu || record_id_stable) {
            // Nothing moved and the RecordId is stable: byte-level no-op.
            return Ok(());
        }

        // Tombstone composite at the superseded RecordId, covering the
        // chains the old record is leaving.
        if any_unlink && session.tracker.before_record_id.is_valid() {
            session.keys.clear();
            session.keys.extend(unlink_keys.iter().copied());
            let saved_roles = std::mem::take(&mut session.roles);
            session.roles.extend(session.keys.iter().map(|k| match k {
                Some(_) => KeyRole::UnlinkOld,
                None => KeyRole::Null,
            }));
            self.build_composite(session);
            self.store.insert(
                &mut session.store,
                &session.scratch,
                session.tracker.before_record_id,
            )?;
            session.roles = saved_roles;
        }

        // Live composite at the new RecordId. An unchanged-keys RCU still
        // relinks everything: the old entries carry a RecordId the liveness
        // check will reject.
        session.keys.clear();
        let after_snapshot: Vec<Option<K>> = session.tracker.after.clone();
        session.keys.extend(after_snapshot);
        if session.keys.iter().all(Option::is_none) {
            return Ok(());
        }
        self.build_composite(session);
        self.store
            .insert(&mut session.store, &session.scratch, new_record_id)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Lazy, finite, non-restartable stream of RecordIds whose predicate
    /// `ordinal` currently maps to `key`. Tombstoned RecordIds are
    /// suppressed; liveness against the primary is the manager's job.
    pub fn query<'g>(
        &'g self,
        session: &mut GroupSession<K>,
        ordinal: u8,
        key: K,
        cancel: CancellationToken,
    ) -> Result<ChainStream<'g, K>> {
        if usize::from(ordinal) >= self.funcs.len() {
            return Err(ChaindexError::InvalidArgument(format!(
                "predicate ordinal {ordinal} out of range for group {}",
                self.id.0
            )));
        }
        session.store.next_serial();
        Ok(ChainStream::new(
            &self.store,
            session.store.clone(),
            ordinal,
            key,
            cancel,
        ))
    }

    /// Index the removal of a record: a tombstone composite over the
    /// before-image at the dead RecordId.
    pub fn delete(&self, session: &mut GroupSession<K>, before: &V, record_id: RecordId) -> Result<()> {
        self.eval_into(before, &mut session.keys)?;
        if session.keys.iter().all(Option::is_none) {
            return Ok(());
        }
        session.roles.clear();
        session
            .roles
            .extend(session.keys.iter().map(|k| match k {
                Some(_) => KeyRole::Delete,
                None => KeyRole::Null,
            }));
        self.build_composite(session);
        self.store.insert(&mut session.store, &session.scratch, record_id)
    }
}
