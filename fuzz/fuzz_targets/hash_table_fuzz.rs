//! Fuzz the hash-table probe/install/CAS paths with arbitrary hashes and
//! address updates, checking the table never loses or corrupts a slot.

#![no_main]

use libfuzzer_sys::fuzz_target;

use chaindex::Address;
use chaindex::store::hash_table::{HashTable, entry_address, entry_tag, pack_entry};

fuzz_target!(|data: &[u8]| {
    let table = HashTable::new(1 << 8);
    let mut chunks = data.chunks_exact(9);
    for chunk in &mut chunks {
        let hash = u64::from_le_bytes(chunk[..8].try_into().unwrap());
        let op = chunk[8];
        match op % 3 {
            0 => {
                let _ = table.find_tag(hash);
            }
            1 => {
                if let Ok((slot, entry)) = table.find_or_create_tag(hash) {
                    // The installed entry must carry the tag it was probed
                    // with, and the slot must now resolve to that tag.
                    assert_ne!(entry_tag(entry), 0);
                    assert_eq!(entry_tag(table.load(slot)), entry_tag(entry));
                }
            }
            _ => {
                if let Ok((slot, entry)) = table.find_or_create_tag(hash) {
                    let addr = Address::new(u64::from(op) + 1);
                    let new = pack_entry(entry_tag(entry), addr);
                    let actual = table.cas(slot, entry, new);
                    if actual == entry {
                        assert_eq!(entry_address(table.load(slot)), addr);
                    }
                }
            }
        }
    }
});
