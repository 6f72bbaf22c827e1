//! Concurrent mutator/reader interleavings.
//!
//! Sessions are single-owner, so concurrency means many sessions sharing
//! one index. These tests drive parallel writers (and a reader running
//! against the moving tail) and then verify that the index converged to
//! exactly the model state — chains intact, nothing lost, nothing
//! duplicated.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chaindex::{
    CancellationToken, IndexManager, InMemoryDevice, LogPrimary, LogSettings, PredicateDef,
    PredicateHandle, QueryOptions, RegistrationSettings, Xxh64Comparer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reading {
    sensor: u64,
    level: u64,
}

fn settings() -> RegistrationSettings {
    RegistrationSettings {
        hash_table_size: 1 << 10,
        log: LogSettings {
            memory_bits: 22,
            segment_bits: 22,
            page_bits: 12,
            read_cache: None,
        },
        ..RegistrationSettings::default()
    }
}

fn build() -> (
    Arc<LogPrimary<u64, Reading>>,
    Arc<IndexManager<LogPrimary<u64, Reading>>>,
    PredicateHandle,
) {
    let primary = Arc::new(LogPrimary::new());
    let mut manager = IndexManager::attach(Arc::clone(&primary));
    let (_, handles) = manager
        .register_group(
            settings(),
            Arc::new(InMemoryDevice::new()),
            Xxh64Comparer,
            vec![PredicateDef::new("level", |v: &Reading| Some(v.level))],
        )
        .unwrap();
    (primary, Arc::new(manager), handles[0].clone())
}

#[test]
fn parallel_writers_disjoint_keys() {
    let (primary, manager, pred) = build();
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 250;

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let primary = Arc::clone(&primary);
        let manager = Arc::clone(&manager);
        handles.push(std::thread::spawn(move || {
            let mut session = manager.new_session();
            for i in 0..PER_WRITER {
                let id = w * PER_WRITER + i;
                let reading = Reading {
                    sensor: id,
                    level: id % 5,
                };
                let rid = primary.upsert(id, reading);
                manager.upsert(None, &reading, rid, &mut session).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut session = manager.new_session();
    for level in 0..5u64 {
        let got: BTreeSet<u64> = manager
            .query(&pred, level, &mut session, QueryOptions::default())
            .unwrap()
            .map(|r| r.unwrap().key)
            .collect();
        let expected: BTreeSet<u64> = (0..WRITERS * PER_WRITER)
            .filter(|id| id % 5 == level)
            .collect();
        assert_eq!(got, expected, "level {level}");
    }
}

#[test]
fn parallel_writers_contended_chain() {
    // All writers hammer the same (predicate, key) chain.
    let (primary, manager, pred) = build();
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 100;

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let primary = Arc::clone(&primary);
        let manager = Arc::clone(&manager);
        handles.push(std::thread::spawn(move || {
            let mut session = manager.new_session();
            for i in 0..PER_WRITER {
                let id = w * PER_WRITER + i;
                let reading = Reading { sensor: id, level: 7 };
                let rid = primary.upsert(id, reading);
                manager.upsert(None, &reading, rid, &mut session).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut session = manager.new_session();
    let got: BTreeSet<u64> = manager
        .query(&pred, 7u64, &mut session, QueryOptions::default())
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    let expected: BTreeSet<u64> = (0..WRITERS * PER_WRITER).collect();
    assert_eq!(got, expected);
}

#[test]
fn reader_runs_against_moving_tail() {
    let (primary, manager, pred) = build();
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        let pred = pred.clone();
        std::thread::spawn(move || {
            let mut session = manager.new_session();
            let mut last_seen = 0usize;
            while !done.load(Ordering::Acquire) {
                let hits: Vec<u64> = manager
                    .query(&pred, 3u64, &mut session, QueryOptions::default())
                    .unwrap()
                    .map(|r| r.unwrap().key)
                    .collect();
                // The set only grows; every hit is a real level-3 id.
                assert!(hits.len() >= last_seen);
                assert!(hits.iter().all(|id| id % 5 == 3));
                last_seen = hits.len();
            }
            last_seen
        })
    };

    {
        let mut session = manager.new_session();
        for id in 0..500u64 {
            let reading = Reading {
                sensor: id,
                level: id % 5,
            };
            let rid = primary.upsert(id, reading);
            manager.upsert(None, &reading, rid, &mut session).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();

    let mut session = manager.new_session();
    let final_count = manager
        .query(&pred, 3u64, &mut session, QueryOptions::default())
        .unwrap()
        .count();
    assert_eq!(final_count, 100);
}

#[test]
fn cancellation_stops_the_stream_early() {
    let (primary, manager, pred) = build();
    let mut session = manager.new_session();
    for id in 0..100u64 {
        let reading = Reading { sensor: id, level: 1 };
        let rid = primary.upsert(id, reading);
        manager.upsert(None, &reading, rid, &mut session).unwrap();
    }

    let cancel = CancellationToken::new();
    let mut results = manager
        .query(
            &pred,
            1u64,
            &mut session,
            QueryOptions::cancelled_by(cancel.clone()),
        )
        .unwrap();

    assert!(results.next().is_some());
    assert!(results.next().is_some());
    cancel.cancel();
    assert!(results.next().is_none(), "cancelled stream must terminate");
}

#[test]
fn sessions_are_independent() {
    let (primary, manager, pred) = build();
    let mut s1 = manager.new_session();
    let mut s2 = manager.new_session();

    let r = Reading { sensor: 1, level: 2 };
    let rid = primary.upsert(1, r);
    manager.upsert(None, &r, rid, &mut s1).unwrap();

    // A second session immediately observes the published record.
    let hits: Vec<u64> = manager
        .query(&pred, 2u64, &mut s2, QueryOptions::default())
        .unwrap()
        .map(|h| h.unwrap().key)
        .collect();
    assert_eq!(hits, vec![1]);
}
