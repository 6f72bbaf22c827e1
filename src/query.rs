//! The query engine.
//!
//! Every query surface produces a *lazy, finite, non-restartable* stream.
//! The building block is a [`ChainStream`]: one predicate-key chain walked
//! newest-to-oldest, with tombstoned RecordIds suppressed through a local
//! dead-records set. Boolean composition merges several chain streams by
//! descending RecordId — each stream is individually descending because
//! chains only grow downward — and evaluates a match function over which
//! streams contain the current candidate.
//!
//! Candidates that survive composition still face the primary-side liveness
//! check before being surfaced with their user key and value.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::addr::{Address, RecordId};
use crate::error::Result;
use crate::hash::IndexKey;
use crate::primary::{LivenessSession, PrimaryStore};
use crate::store::{ChainRead, QueryKey, SecondaryStore, StoreSession};

// ── Cancellation ───────────────────────────────────────────────────────────

/// Cooperative cancellation, checked between chain steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-query knobs.
#[derive(Default)]
pub struct QueryOptions {
    pub cancel: CancellationToken,
    /// Called with the stream index when a sub-stream exhausts during a
    /// composite query; returning `false` aborts the whole query.
    pub on_stream_ended: Option<Box<dyn FnMut(usize) -> bool + Send>>,
}

impl QueryOptions {
    pub fn cancelled_by(cancel: CancellationToken) -> Self {
        QueryOptions {
            cancel,
            on_stream_ended: None,
        }
    }
}

// ── Single-chain stream ────────────────────────────────────────────────────

enum StreamState {
    Start,
    At(Address),
    Done,
}

/// Lazy walk of one (predicate, key) chain, yielding live RecordIds
/// newest-first. Suspended reads are completed eagerly.
pub struct ChainStream<'g, K: IndexKey> {
    store: &'g SecondaryStore<K>,
    session: StoreSession,
    query: QueryKey<K>,
    state: StreamState,
    dead: HashSet<RecordId>,
    last: Option<RecordId>,
    cancel: CancellationToken,
}

impl<'g, K: IndexKey> ChainStream<'g, K> {
    pub(crate) fn new(
        store: &'g SecondaryStore<K>,
        session: StoreSession,
        ordinal: u8,
        key: K,
        cancel: CancellationToken,
    ) -> Self {
        let hash = store.chain_hash(ordinal, &key);
        ChainStream {
            store,
            session,
            query: QueryKey { ordinal, key, hash },
            state: StreamState::Start,
            dead: HashSet::new(),
            last: None,
            cancel,
        }
    }
}

impl<K: IndexKey> Iterator for ChainStream<'_, K> {
    type Item = Result<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.is_cancelled() {
                self.state = StreamState::Done;
                return None;
            }
            let start = match self.state {
                StreamState::Done => return None,
                StreamState::Start => None,
                StreamState::At(a) => {
                    if !a.is_valid() {
                        self.state = StreamState::Done;
                        return None;
                    }
                    Some(a)
                }
            };
            let step = self
                .store
                .read_chain(&mut self.session, &self.query, start)
                .and_then(|outcome| match outcome {
                    ChainRead::Pending(p) => self.store.complete_read(p),
                    other => Ok(other),
                });
            match step {
                Err(e) => {
                    self.state = StreamState::Done;
                    return Some(Err(e));
                }
                Ok(ChainRead::NotFound) => {
                    self.state = StreamState::Done;
                    return None;
                }
                Ok(ChainRead::Pending(_)) => {
                    self.state = StreamState::Done;
                    return Some(Err(crate::error::ChaindexError::Internal(
                        "pending read after completion".into(),
                    )));
                }
                Ok(ChainRead::Found {
                    record_id,
                    deleted,
                    next,
                    ..
                }) => {
                    self.state = StreamState::At(next);
                    if deleted {
                        self.dead.insert(record_id);
                        continue;
                    }
                    if self.dead.contains(&record_id) {
                        continue;
                    }
                    // Concurrent writers can reorder RecordIds slightly
                    // within a chain; drop anything not strictly descending.
                    if self.last.is_some_and(|l| record_id >= l) {
                        continue;
                    }
                    self.last = Some(record_id);
                    return Some(Ok(record_id));
                }
            }
        }
    }
}

// ── Stream merge / boolean composition ─────────────────────────────────────

/// Type-erased descending RecordId stream.
pub type RidStream<'a> = Box<dyn Iterator<Item = Result<RecordId>> + 'a>;

struct Leg<'a> {
    iter: RidStream<'a>,
    head: Option<RecordId>,
    primed: bool,
    ended_notified: bool,
}

impl Leg<'_> {
    /// Pull the next head. Errors bubble out of the merge.
    fn advance(&mut self) -> Result<()> {
        self.primed = true;
        match self.iter.next() {
            Some(Ok(rid)) => {
                self.head = Some(rid);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                self.head = None;
                Ok(())
            }
        }
    }
}

/// N-way merge of descending RecordId streams with an arbitrary boolean
/// match function over per-stream candidate membership.
pub struct RidMerge<'a> {
    legs: Vec<Leg<'a>>,
    match_fn: Box<dyn FnMut(&[bool]) -> bool + 'a>,
    on_stream_ended: Option<Box<dyn FnMut(usize) -> bool + Send>>,
    flags: Vec<bool>,
    aborted: bool,
}

impl<'a> RidMerge<'a> {
    pub(crate) fn new(
        streams: Vec<RidStream<'a>>,
        match_fn: Box<dyn FnMut(&[bool]) -> bool + 'a>,
        on_stream_ended: Option<Box<dyn FnMut(usize) -> bool + Send>>,
    ) -> Self {
        let flags = vec![false; streams.len()];
        RidMerge {
            legs: streams
                .into_iter()
                .map(|iter| Leg {
                    iter,
                    head: None,
                    primed: false,
                    ended_notified: false,
                })
                .collect(),
            match_fn,
            on_stream_ended,
            flags,
            aborted: false,
        }
    }

    fn note_ended(&mut self, idx: usize) {
        if self.legs[idx].ended_notified {
            return;
        }
        self.legs[idx].ended_notified = true;
        if let Some(cb) = self.on_stream_ended.as_mut()
            && !cb(idx)
        {
            self.aborted = true;
        }
    }
}

impl Iterator for RidMerge<'_> {
    type Item = Result<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.aborted {
            return None;
        }
        // Prime lazily so construction stays cheap.
        for i in 0..self.legs.len() {
            if !self.legs[i].primed {
                if let Err(e) = self.legs[i].advance() {
                    self.aborted = true;
                    return Some(Err(e));
                }
                if self.legs[i].head.is_none() {
                    self.note_ended(i);
                    if self.aborted {
                        return None;
                    }
                }
            }
        }

        loop {
            let candidate = self.legs.iter().filter_map(|l| l.head).max()?;
            for (i, leg) in self.legs.iter().enumerate() {
                self.flags[i] = leg.head == Some(candidate);
            }
            let matched = (self.match_fn)(&self.flags);

            // Advance every stream sitting on the candidate.
            for i in 0..self.legs.len() {
                if self.legs[i].head == Some(candidate) {
                    if let Err(e) = self.legs[i].advance() {
                        self.aborted = true;
                        return Some(Err(e));
                    }
                    if self.legs[i].head.is_none() {
                        self.note_ended(i);
                    }
                }
            }
            if matched {
                return Some(Ok(candidate));
            }
            if self.aborted {
                return None;
            }
        }
    }
}

// ── Liveness-gated results ─────────────────────────────────────────────────

/// One surfaced query hit: the RecordId and the primary record it resolves
/// to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMatch<PK, PV> {
    pub record_id: RecordId,
    pub key: PK,
    pub value: PV,
}

/// Final query stream: composition output filtered by the liveness check
/// and joined with the primary record.
///
/// Holds the issuing session's [`LivenessSession`] for its whole lifetime,
/// so one session has at most one result stream in flight.
pub struct QueryResults<'a, P: PrimaryStore> {
    primary: &'a P,
    liveness: &'a mut LivenessSession,
    inner: RidStream<'a>,
}

impl<'a, P: PrimaryStore> QueryResults<'a, P> {
    pub(crate) fn new(
        primary: &'a P,
        liveness: &'a mut LivenessSession,
        inner: RidStream<'a>,
    ) -> Self {
        QueryResults {
            primary,
            liveness,
            inner,
        }
    }
}

impl<P: PrimaryStore> Iterator for QueryResults<'_, P> {
    type Item = Result<QueryMatch<P::UserKey, P::UserValue>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rid = match self.inner.next()? {
                Ok(rid) => rid,
                Err(e) => return Some(Err(e)),
            };
            // Address-based read; a truncated or deleted record is stale.
            let Some((key, value)) = self.primary.read_at(rid) else {
                continue;
            };
            if self.liveness.is_live(self.primary, &key, rid) {
                return Some(Ok(QueryMatch {
                    record_id: rid,
                    key,
                    value,
                }));
            }
        }
    }
}
