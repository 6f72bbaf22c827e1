//! The index manager: registration, mutation fan-out, queries, and the
//! persistence hooks.
//!
//! The manager owns every group (arena-style: groups own stores, sessions
//! hold indices, nothing points back) and is attached to exactly one
//! primary store at construction. Mutations fan out to all groups; queries
//! are routed to the groups named by their predicate handles, composed, and
//! filtered through the primary-side liveness check before anything reaches
//! the caller.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::addr::RecordId;
use crate::checkpoint::{
    CheckpointKind, CheckpointManifest, CheckpointToken, GroupManifest, read_manifest,
    recover_group_images, write_group_images, write_manifest,
};
use crate::config::RegistrationSettings;
use crate::device::SharedDevice;
use crate::error::{ChaindexError, Result, Status};
use crate::group::{Group, GroupId, GroupSession, PredicateDef, PredicateHandle, UpdateOp};
use crate::hash::{IndexKey, KeyComparer};
use crate::query::{
    CancellationToken, ChainStream, QueryOptions, QueryResults, RidMerge, RidStream,
};
use crate::primary::PrimaryStore;
use crate::session::IndexSession;
use crate::store::StatsSnapshot;

// ── Type-erased group dispatch ─────────────────────────────────────────────

/// Object-safe face of a typed [`Group`], used for fan-out and persistence.
trait GroupDispatch<V>: Send + Sync {
    fn new_session_state(&self) -> Box<dyn Any + Send>;
    fn dispatch_insert(&self, state: &mut (dyn Any + Send), after: &V, rid: RecordId)
    -> Result<()>;
    fn dispatch_pre_update(
        &self,
        state: &mut (dyn Any + Send),
        before: &V,
        rid: RecordId,
    ) -> Result<()>;
    fn dispatch_post_update(
        &self,
        state: &mut (dyn Any + Send),
        after: &V,
        new_rid: RecordId,
        op: UpdateOp,
    ) -> Result<()>;
    fn dispatch_delete(
        &self,
        state: &mut (dyn Any + Send),
        before: &V,
        rid: RecordId,
    ) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn flush_and_evict(&self) -> Result<()>;
    fn dispose_from_memory(&mut self) -> Result<()>;
    fn checkpoint(&self, dir: &Path, token: &str, kind: CheckpointKind) -> Result<GroupManifest>;
    fn recover(
        &self,
        dir: &Path,
        table_token: &str,
        table_manifest: &GroupManifest,
        log_token: &str,
        log_manifest: &GroupManifest,
    ) -> Result<()>;
    fn stats(&self) -> StatsSnapshot;
    fn predicate_by_name(&self, name: &str) -> Result<PredicateHandle>;
    fn handles(&self) -> Vec<PredicateHandle>;
    fn as_any(&self) -> &dyn Any;
}

fn state_mismatch() -> ChaindexError {
    ChaindexError::InvalidOperation("session state does not belong to this group".into())
}

impl<K: IndexKey, V: Send + Sync + 'static> GroupDispatch<V> for Group<K, V> {
    fn new_session_state(&self) -> Box<dyn Any + Send> {
        Box::new(self.new_session())
    }

    fn dispatch_insert(
        &self,
        state: &mut (dyn Any + Send),
        after: &V,
        rid: RecordId,
    ) -> Result<()> {
        let gs = state
            .downcast_mut::<GroupSession<K>>()
            .ok_or_else(state_mismatch)?;
        self.insert(gs, after, rid)
    }

    fn dispatch_pre_update(
        &self,
        state: &mut (dyn Any + Send),
        before: &V,
        rid: RecordId,
    ) -> Result<()> {
        let gs = state
            .downcast_mut::<GroupSession<K>>()
            .ok_or_else(state_mismatch)?;
        self.pre_update(gs, before, rid)
    }

    fn dispatch_post_update(
        &self,
        state: &mut (dyn Any + Send),
        after: &V,
        new_rid: RecordId,
        op: UpdateOp,
    ) -> Result<()> {
        let gs = state
            .downcast_mut::<GroupSession<K>>()
            .ok_or_else(state_mismatch)?;
        self.post_update(gs, after, new_rid, op)
    }

    fn dispatch_delete(
        &self,
        state: &mut (dyn Any + Send),
        before: &V,
        rid: RecordId,
    ) -> Result<()> {
        let gs = state
            .downcast_mut::<GroupSession<K>>()
            .ok_or_else(state_mismatch)?;
        self.delete(gs, before, rid)
    }

    fn flush(&self) -> Result<()> {
        self.store().flush()
    }

    fn flush_and_evict(&self) -> Result<()> {
        self.store().flush_and_evict()
    }

    fn dispose_from_memory(&mut self) -> Result<()> {
        self.store_mut().dispose_from_memory()
    }

    fn checkpoint(&self, dir: &Path, token: &str, kind: CheckpointKind) -> Result<GroupManifest> {
        let store = self.store();
        store.enter_prepare();
        store.pivot_version();
        let manifest = write_group_images(store, self.id().0, kind, dir, token);
        store.enter_wait_flush();
        let flushed = store.flush();
        store.finish_checkpoint();
        flushed?;
        manifest
    }

    fn recover(
        &self,
        dir: &Path,
        table_token: &str,
        table_manifest: &GroupManifest,
        log_token: &str,
        log_manifest: &GroupManifest,
    ) -> Result<()> {
        recover_group_images(
            self.store(),
            dir,
            table_token,
            table_manifest,
            log_token,
            log_manifest,
        )
    }

    fn stats(&self) -> StatsSnapshot {
        self.store().stats()
    }

    fn predicate_by_name(&self, name: &str) -> Result<PredicateHandle> {
        self.predicate(name)
    }

    fn handles(&self) -> Vec<PredicateHandle> {
        Group::handles(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

/// The subset hash index over one primary store.
pub struct IndexManager<P: PrimaryStore> {
    primary: Arc<P>,
    groups: Vec<Box<dyn GroupDispatch<P::UserValue>>>,
    checkpoint_seq: AtomicU64,
    last_checkpoint: Mutex<Option<CheckpointToken>>,
}

impl<P: PrimaryStore> IndexManager<P> {
    /// Attach a new, empty index to `primary`.
    pub fn attach(primary: Arc<P>) -> Self {
        IndexManager {
            primary,
            groups: Vec::new(),
            checkpoint_seq: AtomicU64::new(0),
            last_checkpoint: Mutex::new(None),
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Register a predicate group. Handles come back in definition order.
    pub fn register_group<K: IndexKey>(
        &mut self,
        settings: RegistrationSettings,
        device: SharedDevice,
        comparer: impl KeyComparer<K>,
        defs: Vec<PredicateDef<K, P::UserValue>>,
    ) -> Result<(GroupId, Vec<PredicateHandle>)> {
        let id = GroupId(self.groups.len() as u32);
        let group = Group::new(id, &settings, device, Box::new(comparer), defs)?;
        let handles = GroupDispatch::handles(&group);
        info!(group = id.0, predicates = handles.len(), "group registered");
        self.groups.push(Box::new(group));
        Ok((id, handles))
    }

    /// Resolve a predicate by (group, name).
    pub fn predicate(&self, group: GroupId, name: &str) -> Result<PredicateHandle> {
        self.group_dispatch(group)?.predicate_by_name(name)
    }

    /// Open a session. One logical flow per session; not thread-safe.
    pub fn new_session(&self) -> IndexSession {
        IndexSession::new(self.groups.iter().map(|g| g.new_session_state()).collect())
    }

    /// Per-group store statistics, in group order.
    pub fn stats(&self) -> Vec<StatsSnapshot> {
        self.groups.iter().map(|g| g.stats()).collect()
    }

    fn group_dispatch(&self, id: GroupId) -> Result<&dyn GroupDispatch<P::UserValue>> {
        self.groups
            .get(id.0 as usize)
            .map(|g| g.as_ref())
            .ok_or_else(|| ChaindexError::InvalidArgument(format!("unknown group {}", id.0)))
    }

    fn typed_group<K: IndexKey>(&self, id: GroupId) -> Result<&Group<K, P::UserValue>> {
        self.group_dispatch(id)?
            .as_any()
            .downcast_ref::<Group<K, P::UserValue>>()
            .ok_or_else(|| {
                ChaindexError::InvalidArgument(format!(
                    "group {} does not use this predicate-key type",
                    id.0
                ))
            })
    }

    fn fan_out(
        &self,
        session: &mut IndexSession,
        mut op: impl FnMut(
            &dyn GroupDispatch<P::UserValue>,
            &mut (dyn Any + Send),
        ) -> Result<()>,
    ) -> Result<Status> {
        session.ensure_usable(self.groups.len())?;
        for (i, group) in self.groups.iter().enumerate() {
            let result = op(group.as_ref(), session.states[i].as_mut());
            if let Err(e) = result {
                if e.poisons_session() {
                    session.poisoned = true;
                }
                return Err(e);
            }
        }
        Ok(Status::Ok)
    }

    // ── Mutation fan-out ─────────────────────────────────────────────────

    /// Index a fresh insert (`before` = `None`) or a whole-record upsert.
    ///
    /// The upsert form has no before-RecordId to tombstone; superseded
    /// chain entries are suppressed by the query-side liveness check. Use
    /// [`Self::pre_update`]/[`Self::update`] when the old RecordId is known.
    pub fn upsert(
        &self,
        before: Option<&P::UserValue>,
        after: &P::UserValue,
        record_id: RecordId,
        session: &mut IndexSession,
    ) -> Result<Status> {
        self.fan_out(session, |g, state| match before {
            None => g.dispatch_insert(state, after, record_id),
            Some(b) => {
                g.dispatch_pre_update(state, b, RecordId::INVALID)?;
                g.dispatch_post_update(state, after, record_id, UpdateOp::Rcu)
            }
        })
    }

    /// Capture before-images ahead of a primary update.
    pub fn pre_update(
        &self,
        before: &P::UserValue,
        before_record_id: RecordId,
        session: &mut IndexSession,
    ) -> Result<Status> {
        self.fan_out(session, |g, state| {
            g.dispatch_pre_update(state, before, before_record_id)
        })
    }

    /// Complete a tracked update after the primary mutation.
    pub fn update(
        &self,
        after: &P::UserValue,
        new_record_id: RecordId,
        op: UpdateOp,
        session: &mut IndexSession,
    ) -> Result<Status> {
        self.fan_out(session, |g, state| {
            g.dispatch_post_update(state, after, new_record_id, op)
        })
    }

    /// Index the removal of `record_id`.
    pub fn delete(
        &self,
        before: &P::UserValue,
        record_id: RecordId,
        session: &mut IndexSession,
    ) -> Result<Status> {
        self.fan_out(session, |g, state| {
            g.dispatch_delete(state, before, record_id)
        })
    }

    // ── Queries ──────────────────────────────────────────────────────────

    fn chain_stream<'a, K: IndexKey>(
        &'a self,
        pred: &PredicateHandle,
        key: K,
        session: &mut IndexSession,
        cancel: CancellationToken,
    ) -> Result<ChainStream<'a, K>> {
        session.ensure_usable(self.groups.len())?;
        let group = self.typed_group::<K>(pred.group())?;
        let state = session
            .states
            .get_mut(pred.group().0 as usize)
            .ok_or_else(state_mismatch)?;
        let gs = state
            .downcast_mut::<GroupSession<K>>()
            .ok_or_else(state_mismatch)?;
        group.query(gs, pred.ordinal(), key, cancel)
    }

    /// Union of one predicate's chains over several keys, as one descending
    /// stream.
    fn term_stream<'a, K: IndexKey>(
        &'a self,
        pred: &PredicateHandle,
        keys: Vec<K>,
        session: &mut IndexSession,
        cancel: &CancellationToken,
    ) -> Result<RidStream<'a>> {
        if keys.is_empty() {
            return Err(ChaindexError::InvalidArgument(format!(
                "no keys given for predicate '{}'",
                pred.name()
            )));
        }
        if keys.len() == 1 {
            let key = keys.into_iter().next().expect("one key");
            return Ok(Box::new(self.chain_stream(pred, key, session, cancel.clone())?));
        }
        let mut streams: Vec<RidStream<'a>> = Vec::with_capacity(keys.len());
        for key in keys {
            streams.push(Box::new(self.chain_stream(
                pred,
                key,
                session,
                cancel.clone(),
            )?));
        }
        Ok(Box::new(RidMerge::new(
            streams,
            Box::new(|flags: &[bool]| flags.iter().any(|b| *b)),
            None,
        )))
    }

    /// Single-predicate, single-key query. The result stream holds the
    /// session's liveness session, so the session has one query in flight.
    pub fn query<'a, K: IndexKey>(
        &'a self,
        pred: &PredicateHandle,
        key: K,
        session: &'a mut IndexSession,
        opts: QueryOptions,
    ) -> Result<QueryResults<'a, P>> {
        let stream = self.chain_stream(pred, key, session, opts.cancel.clone())?;
        Ok(QueryResults::new(
            self.primary.as_ref(),
            &mut session.liveness,
            Box::new(stream),
        ))
    }

    /// Single-predicate query, union over `keys`.
    pub fn query_keys<'a, K: IndexKey>(
        &'a self,
        pred: &PredicateHandle,
        keys: Vec<K>,
        session: &'a mut IndexSession,
        opts: QueryOptions,
    ) -> Result<QueryResults<'a, P>> {
        let stream = self.term_stream(pred, keys, session, &opts.cancel)?;
        Ok(QueryResults::new(
            self.primary.as_ref(),
            &mut session.liveness,
            stream,
        ))
    }

    /// Two-chain boolean composition; the key types may differ.
    pub fn query2<'a, K1, K2, M>(
        &'a self,
        p1: &PredicateHandle,
        k1: K1,
        p2: &PredicateHandle,
        k2: K2,
        match_fn: M,
        session: &'a mut IndexSession,
        opts: QueryOptions,
    ) -> Result<QueryResults<'a, P>>
    where
        K1: IndexKey,
        K2: IndexKey,
        M: FnMut(bool, bool) -> bool + 'a,
    {
        let mut opts = opts;
        let s1: RidStream<'a> =
            Box::new(self.chain_stream(p1, k1, session, opts.cancel.clone())?);
        let s2: RidStream<'a> =
            Box::new(self.chain_stream(p2, k2, session, opts.cancel.clone())?);
        let mut match_fn = match_fn;
        let merge = RidMerge::new(
            vec![s1, s2],
            Box::new(move |f: &[bool]| match_fn(f[0], f[1])),
            opts.on_stream_ended.take(),
        );
        Ok(QueryResults::new(
            self.primary.as_ref(),
            &mut session.liveness,
            Box::new(merge),
        ))
    }

    /// Three-chain boolean composition; the key types may differ.
    #[allow(clippy::too_many_arguments)]
    pub fn query3<'a, K1, K2, K3, M>(
        &'a self,
        p1: &PredicateHandle,
        k1: K1,
        p2: &PredicateHandle,
        k2: K2,
        p3: &PredicateHandle,
        k3: K3,
        match_fn: M,
        session: &'a mut IndexSession,
        opts: QueryOptions,
    ) -> Result<QueryResults<'a, P>>
    where
        K1: IndexKey,
        K2: IndexKey,
        K3: IndexKey,
        M: FnMut(bool, bool, bool) -> bool + 'a,
    {
        let mut opts = opts;
        let s1: RidStream<'a> =
            Box::new(self.chain_stream(p1, k1, session, opts.cancel.clone())?);
        let s2: RidStream<'a> =
            Box::new(self.chain_stream(p2, k2, session, opts.cancel.clone())?);
        let s3: RidStream<'a> =
            Box::new(self.chain_stream(p3, k3, session, opts.cancel.clone())?);
        let mut match_fn = match_fn;
        let merge = RidMerge::new(
            vec![s1, s2, s3],
            Box::new(move |f: &[bool]| match_fn(f[0], f[1], f[2])),
            opts.on_stream_ended.take(),
        );
        Ok(QueryResults::new(
            self.primary.as_ref(),
            &mut session.liveness,
            Box::new(merge),
        ))
    }

    /// N-way composition over one key type. Each term is (predicate, keys)
    /// with the keys unioned; `match_fn` sees per-term membership.
    pub fn query_n<'a, K, M>(
        &'a self,
        terms: Vec<(PredicateHandle, Vec<K>)>,
        match_fn: M,
        session: &'a mut IndexSession,
        opts: QueryOptions,
    ) -> Result<QueryResults<'a, P>>
    where
        K: IndexKey,
        M: FnMut(&[bool]) -> bool + 'a,
    {
        let mut opts = opts;
        let mut streams: Vec<RidStream<'a>> = Vec::with_capacity(terms.len());
        for (pred, keys) in terms {
            streams.push(self.term_stream(&pred, keys, session, &opts.cancel)?);
        }
        let merge = RidMerge::new(streams, Box::new(match_fn), opts.on_stream_ended.take());
        Ok(QueryResults::new(
            self.primary.as_ref(),
            &mut session.liveness,
            Box::new(merge),
        ))
    }

    /// N-way composition over two key types; `match_fn` receives the
    /// membership slices per key type, in argument order.
    pub fn query_n2<'a, K1, K2, M>(
        &'a self,
        terms1: Vec<(PredicateHandle, Vec<K1>)>,
        terms2: Vec<(PredicateHandle, Vec<K2>)>,
        match_fn: M,
        session: &'a mut IndexSession,
        opts: QueryOptions,
    ) -> Result<QueryResults<'a, P>>
    where
        K1: IndexKey,
        K2: IndexKey,
        M: FnMut(&[bool], &[bool]) -> bool + 'a,
    {
        let mut opts = opts;
        let split = terms1.len();
        let mut streams: Vec<RidStream<'a>> = Vec::with_capacity(split + terms2.len());
        for (pred, keys) in terms1 {
            streams.push(self.term_stream(&pred, keys, session, &opts.cancel)?);
        }
        for (pred, keys) in terms2 {
            streams.push(self.term_stream(&pred, keys, session, &opts.cancel)?);
        }
        let mut match_fn = match_fn;
        let merge = RidMerge::new(
            streams,
            Box::new(move |f: &[bool]| match_fn(&f[..split], &f[split..])),
            opts.on_stream_ended.take(),
        );
        Ok(QueryResults::new(
            self.primary.as_ref(),
            &mut session.liveness,
            Box::new(merge),
        ))
    }

    /// N-way composition over three key types.
    pub fn query_n3<'a, K1, K2, K3, M>(
        &'a self,
        terms1: Vec<(PredicateHandle, Vec<K1>)>,
        terms2: Vec<(PredicateHandle, Vec<K2>)>,
        terms3: Vec<(PredicateHandle, Vec<K3>)>,
        match_fn: M,
        session: &'a mut IndexSession,
        opts: QueryOptions,
    ) -> Result<QueryResults<'a, P>>
    where
        K1: IndexKey,
        K2: IndexKey,
        K3: IndexKey,
        M: FnMut(&[bool], &[bool], &[bool]) -> bool + 'a,
    {
        let mut opts = opts;
        let split1 = terms1.len();
        let split2 = split1 + terms2.len();
        let mut streams: Vec<RidStream<'a>> =
            Vec::with_capacity(split2 + terms3.len());
        for (pred, keys) in terms1 {
            streams.push(self.term_stream(&pred, keys, session, &opts.cancel)?);
        }
        for (pred, keys) in terms2 {
            streams.push(self.term_stream(&pred, keys, session, &opts.cancel)?);
        }
        for (pred, keys) in terms3 {
            streams.push(self.term_stream(&pred, keys, session, &opts.cancel)?);
        }
        let mut match_fn = match_fn;
        let merge = RidMerge::new(
            streams,
            Box::new(move |f: &[bool]| {
                match_fn(&f[..split1], &f[split1..split2], &f[split2..])
            }),
            opts.on_stream_ended.take(),
        );
        Ok(QueryResults::new(
            self.primary.as_ref(),
            &mut session.liveness,
            Box::new(merge),
        ))
    }

    // ── Persistence hooks ────────────────────────────────────────────────

    fn take_checkpoint(&self, dir: &Path, kind: CheckpointKind) -> Result<CheckpointToken> {
        let seq = self.checkpoint_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let token = CheckpointToken::new(seq, kind);
        let mut groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            // Any single group failing fails the whole checkpoint.
            groups.push(group.checkpoint(dir, token.as_str(), kind)?);
        }
        let manifest = CheckpointManifest {
            token: token.clone(),
            kind,
            groups,
        };
        write_manifest(dir, &manifest)?;
        *self.last_checkpoint.lock() = Some(token.clone());
        Ok(token)
    }

    /// Checkpoint every group's hash table and log.
    pub fn take_full_checkpoint(&self, dir: &Path) -> Result<CheckpointToken> {
        self.take_checkpoint(dir, CheckpointKind::Full)
    }

    /// Checkpoint only the hash tables.
    pub fn take_index_checkpoint(&self, dir: &Path) -> Result<CheckpointToken> {
        self.take_checkpoint(dir, CheckpointKind::Index)
    }

    /// Checkpoint only the logs.
    pub fn take_hybrid_log_checkpoint(&self, dir: &Path) -> Result<CheckpointToken> {
        self.take_checkpoint(dir, CheckpointKind::HybridLog)
    }

    /// Wait for the in-flight checkpoint and return its token. Checkpoints
    /// here are written synchronously, so this only reports the last one.
    pub fn complete_checkpoint(&self) -> Result<Option<CheckpointToken>> {
        Ok(self.last_checkpoint.lock().clone())
    }

    /// Rebuild every group from checkpoint token(s): one full token, or an
    /// index token plus a hybrid-log token (in any order).
    pub fn recover(&mut self, dir: &Path, tokens: &[&str]) -> Result<()> {
        let manifests: Vec<CheckpointManifest> = tokens
            .iter()
            .map(|t| read_manifest(dir, *t))
            .collect::<Result<_>>()?;
        let table_src = manifests
            .iter()
            .find(|m| m.kind.has_table())
            .ok_or_else(|| {
                ChaindexError::Recovery("no token carries a hash-table image".into())
            })?;
        let log_src = manifests
            .iter()
            .find(|m| m.kind.has_log())
            .ok_or_else(|| ChaindexError::Recovery("no token carries a log image".into()))?;
        if table_src.groups.len() != self.groups.len() || log_src.groups.len() != self.groups.len()
        {
            return Err(ChaindexError::Recovery(format!(
                "checkpoint has {} groups, index has {}",
                table_src.groups.len(),
                self.groups.len()
            )));
        }
        for (i, group) in self.groups.iter().enumerate() {
            group.recover(
                dir,
                table_src.token.as_str(),
                &table_src.groups[i],
                log_src.token.as_str(),
                &log_src.groups[i],
            )?;
        }
        debug!(tokens = ?tokens, "index recovered");
        Ok(())
    }

    /// Flush every group's log to its device.
    pub fn flush(&self) -> Result<()> {
        for group in &self.groups {
            group.flush()?;
        }
        Ok(())
    }

    /// Flush and evict every group's log; all reads become pending.
    pub fn flush_and_evict(&self) -> Result<()> {
        for group in &self.groups {
            group.flush_and_evict()?;
        }
        Ok(())
    }

    /// Release all in-memory log pages. Exclusive access required.
    pub fn dispose_from_memory(&mut self) -> Result<()> {
        for group in &mut self.groups {
            group.dispose_from_memory()?;
        }
        Ok(())
    }
}
