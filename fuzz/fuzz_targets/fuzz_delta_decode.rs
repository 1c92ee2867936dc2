//! Fuzz target for inbound delta payloads.
//!
//! Payloads come off the wire; decoding and merging them must never panic,
//! whatever the bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shelter_mesh::domain::{AdoptionApplication, Pet};
use shelter_mesh::replica::{DeltaEntries, LwwMap};

fuzz_target!(|data: &[u8]| {
    if let Ok(delta) = serde_json::from_slice::<DeltaEntries<Pet>>(data) {
        let mut map = LwwMap::new();
        map.merge(delta.clone());
        // Idempotent on re-delivery
        assert!(map.merge(delta).is_empty());
        let _ = map.content_hash();
    }
    let _ = serde_json::from_slice::<DeltaEntries<AdoptionApplication>>(data);
    let _ = serde_json::from_slice::<DeltaEntries<i64>>(data);
});
