//! Fuzz target for LWW merge ordering.
//!
//! Applies the same writes forwards and backwards and checks both maps end
//! up identical.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shelter_mesh::replica::{Entry, LwwMap, Timestamp};

fuzz_target!(|data: Vec<(u8, i64, u16, u8)>| {
    let writes: Vec<(String, Entry<i64>)> = data
        .iter()
        .enumerate()
        .map(|(i, (key, value, wall, node))| {
            // The counter is the position, so no two writes share a timestamp
            let ts = Timestamp::new(u64::from(*wall), i as u32, format!("n{}", node % 4));
            (format!("k{}", key % 8), Entry::new(*value, ts))
        })
        .collect();

    let mut forward = LwwMap::new();
    forward.merge(writes.clone());

    let mut backward = LwwMap::new();
    for write in writes.into_iter().rev() {
        backward.merge(vec![write]);
    }

    assert_eq!(forward.snapshot(), backward.snapshot());
    assert_eq!(forward.content_hash(), backward.content_hash());
});
