//! Fuzz the change-tracking update path: arbitrary before/after key
//! vectors must never lose a record or leave a stale chain entry live.

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;

use chaindex::{
    IndexManager, InMemoryDevice, LogPrimary, LogSettings, PredicateDef, QueryOptions,
    RegistrationSettings, UpdateOp, Xxh64Comparer,
};

#[derive(Debug, Clone, Copy)]
struct V([u8; 3]);

fuzz_target!(|data: &[u8]| {
    if data.len() < 6 {
        return;
    }
    let settings = RegistrationSettings {
        hash_table_size: 1 << 6,
        log: LogSettings {
            memory_bits: 16,
            segment_bits: 16,
            page_bits: 10,
            read_cache: None,
        },
        ..RegistrationSettings::default()
    };
    let primary: Arc<LogPrimary<u64, V>> = Arc::new(LogPrimary::new());
    let mut manager = IndexManager::attach(Arc::clone(&primary));
    let (_, handles) = manager
        .register_group(
            settings,
            Arc::new(InMemoryDevice::new()),
            Xxh64Comparer,
            vec![
                PredicateDef::new("p0", |v: &V| Some(u64::from(v.0[0]) % 8)),
                PredicateDef::new("p1", |v: &V| {
                    let k = v.0[1] % 8;
                    if k == 0 { None } else { Some(u64::from(k)) }
                }),
                PredicateDef::new("p2", |v: &V| Some(u64::from(v.0[2]) % 8)),
            ],
        )
        .unwrap();
    let mut session = manager.new_session();

    let before = V([data[0], data[1], data[2]]);
    let after = V([data[3], data[4], data[5]]);

    let rid = primary.upsert(1, before);
    manager.upsert(None, &before, rid, &mut session).unwrap();

    manager.pre_update(&before, rid, &mut session).unwrap();
    let new_rid = primary.upsert(1, after);
    manager
        .update(&after, new_rid, UpdateOp::Rcu, &mut session)
        .unwrap();

    // The after-image must be findable under each of its keys...
    for (i, pred) in handles.iter().enumerate() {
        let key = match i {
            0 => Some(u64::from(after.0[0]) % 8),
            1 => {
                let k = after.0[1] % 8;
                if k == 0 { None } else { Some(u64::from(k)) }
            }
            _ => Some(u64::from(after.0[2]) % 8),
        };
        let Some(key) = key else { continue };
        let hits: Vec<u64> = manager
            .query(pred, key, &mut session, QueryOptions::default())
            .unwrap()
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(hits, vec![1], "predicate {i} key {key}");
    }

    // ...and stale before-keys must be gone.
    let old_key = u64::from(before.0[0]) % 8;
    let new_key = u64::from(after.0[0]) % 8;
    if old_key != new_key {
        let hits = manager
            .query(&handles[0], old_key, &mut session, QueryOptions::default())
            .unwrap()
            .count();
        assert_eq!(hits, 0);
    }
});
