//! End-to-end scenarios over a populated index.
//!
//! A thousand pseudo-random inventory items are inserted through a
//! [`LogPrimary`] with three predicates across two groups (size and color
//! share a group; bin lives in its own). Queries are then checked against a
//! straightforward in-memory model of "current value per user key".

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chaindex::{
    ChaindexError, IndexManager, IndexSession, InMemoryDevice, LogPrimary, LogSettings,
    PredicateDef, PredicateHandle, QueryOptions, RegistrationSettings, Status, UpdateOp,
    Xxh64Comparer,
};

const MEDIUM: u64 = 2;
const XXLARGE: u64 = 10; // never generated; only upserts produce it
const BLUE: u64 = 3;
const RED: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Item {
    size: u64,
    color: u64,
    count: u64,
}

/// xorshift64 with a fixed seed; deterministic across runs.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Rng(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

struct Fixture {
    primary: Arc<LogPrimary<u64, Item>>,
    manager: IndexManager<LogPrimary<u64, Item>>,
    size_pred: PredicateHandle,
    color_pred: PredicateHandle,
    bin_pred: PredicateHandle,
    /// Current value per user key.
    model: HashMap<u64, Item>,
}

fn settings() -> RegistrationSettings {
    RegistrationSettings {
        hash_table_size: 1 << 12,
        log: LogSettings {
            memory_bits: 22,
            segment_bits: 22,
            page_bits: 12,
            read_cache: None,
        },
        ..RegistrationSettings::default()
    }
}

fn build_fixture() -> Fixture {
    let primary = Arc::new(LogPrimary::new());
    let mut manager = IndexManager::attach(Arc::clone(&primary));

    let (_, handles) = manager
        .register_group(
            settings(),
            Arc::new(InMemoryDevice::new()),
            Xxh64Comparer,
            vec![
                PredicateDef::new("size", |v: &Item| Some(v.size)),
                PredicateDef::new("color", |v: &Item| Some(v.color)),
            ],
        )
        .unwrap();
    let size_pred = handles[0].clone();
    let color_pred = handles[1].clone();

    let (_, handles) = manager
        .register_group(
            settings(),
            Arc::new(InMemoryDevice::new()),
            Xxh64Comparer,
            vec![PredicateDef::new("bin", |v: &Item| {
                let bin = v.count / 100;
                if bin < 9 { Some(bin) } else { None }
            })],
        )
        .unwrap();
    let bin_pred = handles[0].clone();

    Fixture {
        primary,
        manager,
        size_pred,
        color_pred,
        bin_pred,
        model: HashMap::new(),
    }
}

fn populate(f: &mut Fixture, session: &mut IndexSession, count: u64) {
    let mut rng = Rng::new(13);
    for id in 0..count {
        let item = Item {
            size: rng.next() % 5,
            color: rng.next() % 7,
            count: rng.next() % 1000,
        };
        let rid = f.primary.upsert(id, item);
        f.manager.upsert(None, &item, rid, session).unwrap();
        f.model.insert(id, item);
    }
}

fn query_ids(
    f: &Fixture,
    pred: &PredicateHandle,
    key: u64,
    session: &mut IndexSession,
) -> BTreeSet<u64> {
    f.manager
        .query(pred, key, session, QueryOptions::default())
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect()
}

fn model_ids(f: &Fixture, select: impl Fn(&Item) -> bool) -> BTreeSet<u64> {
    f.model
        .iter()
        .filter(|(_, v)| select(v))
        .map(|(k, _)| *k)
        .collect()
}

#[test]
fn s1_size_query_matches_model() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 1000);

    let got = query_ids(&f, &f.size_pred.clone(), MEDIUM, &mut session);
    let expected = model_ids(&f, |v| v.size == MEDIUM);
    assert!(!expected.is_empty(), "seed must generate medium items");
    assert_eq!(got, expected);
}

#[test]
fn s2_color_query_matches_model() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 1000);

    let got = query_ids(&f, &f.color_pred.clone(), BLUE, &mut session);
    let expected = model_ids(&f, |v| v.color == BLUE);
    assert!(!expected.is_empty());
    assert_eq!(got, expected);
}

#[test]
fn s3_conjunction_is_intersection() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 1000);

    let got: BTreeSet<u64> = f
        .manager
        .query2(
            &f.size_pred.clone(),
            MEDIUM,
            &f.color_pred.clone(),
            BLUE,
            |a, b| a && b,
            &mut session,
            QueryOptions::default(),
        )
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    let expected = model_ids(&f, |v| v.size == MEDIUM && v.color == BLUE);
    assert_eq!(got, expected);
}

#[test]
fn s4_disjunction_is_union() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 1000);

    let got: BTreeSet<u64> = f
        .manager
        .query3(
            &f.size_pred.clone(),
            MEDIUM,
            &f.color_pred.clone(),
            BLUE,
            &f.bin_pred.clone(),
            7u64,
            |a, b, c| a || b || c,
            &mut session,
            QueryOptions::default(),
        )
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    let expected = model_ids(&f, |v| {
        v.size == MEDIUM || v.color == BLUE || v.count / 100 == 7
    });
    assert_eq!(got, expected);
}

#[test]
fn s5_none_bin_is_never_indexed() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 1000);

    // Items with count in 900..=999 exist, but the predicate maps them to
    // no key at all.
    assert!(f.model.values().any(|v| v.count / 100 == 9));
    let got = query_ids(&f, &f.bin_pred.clone(), 9, &mut session);
    assert!(got.is_empty());
}

#[test]
fn s6_upsert_moves_records_between_chains() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 1000);

    let mediums = model_ids(&f, |v| v.size == MEDIUM);
    for id in &mediums {
        let old = f.model[id];
        let new = Item {
            size: XXLARGE,
            ..old
        };
        let rid = f.primary.upsert(*id, new);
        f.manager
            .upsert(Some(&old), &new, rid, &mut session)
            .unwrap();
        f.model.insert(*id, new);
    }

    assert!(query_ids(&f, &f.size_pred.clone(), MEDIUM, &mut session).is_empty());
    assert_eq!(
        query_ids(&f, &f.size_pred.clone(), XXLARGE, &mut session),
        mediums
    );
}

#[test]
fn s7_delete_empties_chains() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 1000);

    let reds = model_ids(&f, |v| v.color == RED);
    assert!(!reds.is_empty());
    for id in &reds {
        let old = f.model[id];
        let rid = f.primary.delete(id).unwrap();
        f.manager.delete(&old, rid, &mut session).unwrap();
        f.model.remove(id);
    }

    assert!(query_ids(&f, &f.color_pred.clone(), RED, &mut session).is_empty());
    // Other chains lost exactly the red members.
    let got = query_ids(&f, &f.size_pred.clone(), MEDIUM, &mut session);
    assert_eq!(got, model_ids(&f, |v| v.size == MEDIUM));
}

#[test]
fn insert_then_delete_leaves_log_populated_but_queries_empty() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();

    let item = Item {
        size: 1,
        color: 2,
        count: 3,
    };
    let rid = f.primary.upsert(1, item);
    f.manager.upsert(None, &item, rid, &mut session).unwrap();
    let rid = f.primary.delete(&1).unwrap();
    f.manager.delete(&item, rid, &mut session).unwrap();

    assert!(query_ids(&f, &f.size_pred.clone(), 1, &mut session).is_empty());
    assert!(query_ids(&f, &f.color_pred.clone(), 2, &mut session).is_empty());
    // The records are still on the log (insert + tombstone per group).
    let stats = f.manager.stats();
    assert_eq!(stats[0].inserts, 1);
    assert_eq!(stats[0].tombstone_inserts, 1);
}

#[test]
fn identity_update_is_a_store_noop() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();

    let item = Item {
        size: 1,
        color: 2,
        count: 3,
    };
    let rid = f.primary.upsert(7, item);
    f.manager.upsert(None, &item, rid, &mut session).unwrap();

    let before = f.manager.stats();
    // In-place primary update with identical predicate keys.
    let same_rid = f.primary.update_in_place(&7, item).unwrap();
    assert_eq!(same_rid, rid);
    f.manager.pre_update(&item, rid, &mut session).unwrap();
    f.manager
        .update(&item, same_rid, UpdateOp::Ipu, &mut session)
        .unwrap();
    let after = f.manager.stats();
    assert_eq!(before, after, "identity update must not touch the stores");

    // And the record is still queryable exactly once.
    assert_eq!(
        query_ids(&f, &f.size_pred.clone(), 1, &mut session),
        BTreeSet::from([7])
    );
}

#[test]
fn tracked_update_with_changed_key_tombstones_old_chain() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();

    let old = Item {
        size: 1,
        color: 2,
        count: 3,
    };
    let rid = f.primary.upsert(5, old);
    f.manager.upsert(None, &old, rid, &mut session).unwrap();

    let new = Item { size: 3, ..old };
    f.manager.pre_update(&old, rid, &mut session).unwrap();
    let new_rid = f.primary.upsert(5, new);
    f.manager
        .update(&new, new_rid, UpdateOp::Rcu, &mut session)
        .unwrap();
    f.model.insert(5, new);

    assert!(query_ids(&f, &f.size_pred.clone(), 1, &mut session).is_empty());
    assert_eq!(
        query_ids(&f, &f.size_pred.clone(), 3, &mut session),
        BTreeSet::from([5])
    );
    // The tombstone landed: one per changed predicate.
    assert_eq!(f.manager.stats()[0].tombstone_inserts, 1);
}

#[test]
fn queries_survive_eviction_via_pending_reads() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 200);

    f.manager.flush_and_evict().unwrap();

    let got = query_ids(&f, &f.size_pred.clone(), MEDIUM, &mut session);
    assert_eq!(got, model_ids(&f, |v| v.size == MEDIUM));
    let stats = f.manager.stats();
    assert!(
        stats[0].pending_reads > 0,
        "eviction must route reads to disk"
    );
}

#[test]
fn liveness_suppresses_stale_hits_after_external_overwrite() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();

    let item = Item {
        size: 2,
        color: 1,
        count: 10,
    };
    let rid = f.primary.upsert(1, item);
    f.manager.upsert(None, &item, rid, &mut session).unwrap();

    // The primary moves on without telling the index (e.g. a crashed flow).
    let newer = Item { size: 4, ..item };
    f.primary.upsert(1, newer);

    // The stale chain entry for size=2 must be filtered by the session's
    // liveness session on the primary.
    assert!(query_ids(&f, &f.size_pred.clone(), 2, &mut session).is_empty());
    assert!(session.liveness().checks() >= 1);
    assert_eq!(session.liveness().stale_drops(), 1);
}

#[test]
fn query_match_carries_key_value_and_record_id() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();

    let item = Item {
        size: 2,
        color: 6,
        count: 1,
    };
    let rid = f.primary.upsert(42, item);
    f.manager.upsert(None, &item, rid, &mut session).unwrap();

    let hits: Vec<_> = f
        .manager
        .query(
            &f.size_pred.clone(),
            2u64,
            &mut session,
            QueryOptions::default(),
        )
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, 42);
    assert_eq!(hits[0].value, item);
    assert_eq!(hits[0].record_id, rid);
}

#[test]
fn predicates_resolve_by_name() {
    let primary: Arc<LogPrimary<u64, Item>> = Arc::new(LogPrimary::new());
    let mut manager = IndexManager::attach(primary);
    let (gid, handles) = manager
        .register_group(
            settings(),
            Arc::new(InMemoryDevice::new()),
            Xxh64Comparer,
            vec![
                PredicateDef::new("size", |v: &Item| Some(v.size)),
                PredicateDef::new("color", |v: &Item| Some(v.color)),
            ],
        )
        .unwrap();

    let by_name = manager.predicate(gid, "color").unwrap();
    assert_eq!(by_name.ordinal(), handles[1].ordinal());
    assert_eq!(by_name.name(), "color");
    assert!(matches!(
        manager.predicate(gid, "weight"),
        Err(ChaindexError::UnknownPredicate(_))
    ));
}

#[test]
fn predicate_panic_poisons_the_session() {
    let primary: Arc<LogPrimary<u64, Item>> = Arc::new(LogPrimary::new());
    let mut manager = IndexManager::attach(Arc::clone(&primary));
    manager
        .register_group(
            settings(),
            Arc::new(InMemoryDevice::new()),
            Xxh64Comparer,
            vec![PredicateDef::new("spiky", |v: &Item| {
                if v.size == 13 {
                    panic!("unindexable");
                }
                Some(v.size)
            })],
        )
        .unwrap();
    let mut session = manager.new_session();

    let good = Item {
        size: 1,
        color: 0,
        count: 0,
    };
    let rid = primary.upsert(1, good);
    assert_eq!(
        manager.upsert(None, &good, rid, &mut session).unwrap(),
        Status::Ok
    );

    let bad = Item {
        size: 13,
        color: 0,
        count: 0,
    };
    let rid = primary.upsert(2, bad);
    let err = manager.upsert(None, &bad, rid, &mut session).unwrap_err();
    assert!(matches!(err, ChaindexError::Internal(_)));
    assert!(session.is_poisoned());

    // Every further use of the poisoned session is refused.
    let err = manager.upsert(None, &good, rid, &mut session).unwrap_err();
    assert!(matches!(err, ChaindexError::InvalidOperation(_)));

    // A fresh session works fine.
    let mut session = manager.new_session();
    let rid = primary.upsert(3, good);
    manager.upsert(None, &good, rid, &mut session).unwrap();
}

#[test]
fn query_n_composes_across_key_vectors() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 500);

    // (size in {0, 1}) AND (color in {BLUE, RED})
    let got: BTreeSet<u64> = f
        .manager
        .query_n(
            vec![
                (f.size_pred.clone(), vec![0u64, 1]),
                (f.color_pred.clone(), vec![BLUE, RED]),
            ],
            |flags: &[bool]| flags.iter().all(|b| *b),
            &mut session,
            QueryOptions::default(),
        )
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    let expected = model_ids(&f, |v| {
        (v.size == 0 || v.size == 1) && (v.color == BLUE || v.color == RED)
    });
    assert_eq!(got, expected);
}

#[test]
fn query_n2_composes_across_groups() {
    let mut f = build_fixture();
    let mut session = f.manager.new_session();
    populate(&mut f, &mut session, 500);

    // (size == MEDIUM) AND (bin in {0, 1, 2})
    let got: BTreeSet<u64> = f
        .manager
        .query_n2(
            vec![(f.size_pred.clone(), vec![MEDIUM])],
            vec![(f.bin_pred.clone(), vec![0u64, 1, 2])],
            |a: &[bool], b: &[bool]| a[0] && b[0],
            &mut session,
            QueryOptions::default(),
        )
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    let expected = model_ids(&f, |v| v.size == MEDIUM && v.count / 100 <= 2);
    assert_eq!(got, expected);
}
