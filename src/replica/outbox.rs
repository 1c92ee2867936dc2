// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-neighbor delta outbox.
//!
//! Collects entries with key deduplication (latest wins) between gossip
//! ticks, so a key written ten times in one interval travels once.
//!
//! # Design
//!
//! ```text
//! local put ──┬──▶ Outbox(peer) ──▶ tick: drain() ──▶ transport.send()
//!             │   BTreeMap<key, entry>                    │
//! merged  ────┘   (latest ts wins)                        │ Err
//! remote                  ▲                               │
//!                         └──────── restore(entries) ◀────┘
//! ```

use super::lww::{DeltaEntries, Entry};
use std::collections::BTreeMap;

/// Pending entries for one neighbor.
#[derive(Debug)]
pub struct Outbox<V> {
    /// Pending entries keyed by map key (latest wins).
    pending: BTreeMap<String, Entry<V>>,
}

impl<V> Default for Outbox<V> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<V: Clone> Outbox<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an entry. An already-staged entry for the key with an equal or
    /// newer timestamp is kept.
    pub fn stage(&mut self, key: String, entry: Entry<V>) {
        match self.pending.get(&key) {
            Some(staged) if staged.ts >= entry.ts => {}
            _ => {
                self.pending.insert(key, entry);
            }
        }
    }

    pub fn stage_all(&mut self, entries: DeltaEntries<V>) {
        for (key, entry) in entries {
            self.stage(key, entry);
        }
    }

    /// Take everything pending, in key order.
    pub fn drain(&mut self) -> DeltaEntries<V> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Put back entries whose send failed. Anything staged since the drain
    /// that is newer stays.
    pub fn restore(&mut self, entries: DeltaEntries<V>) {
        self.stage_all(entries);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::clock::Timestamp;

    fn entry(value: i64, wall: u64) -> Entry<i64> {
        Entry::new(value, Timestamp::new(wall, 0, "node-a"))
    }

    #[test]
    fn test_latest_wins() {
        let mut outbox = Outbox::new();
        outbox.stage("k".into(), entry(1, 1));
        outbox.stage("k".into(), entry(2, 2));
        outbox.stage("k".into(), entry(0, 0)); // stale

        assert_eq!(outbox.len(), 1);
        let drained = outbox.drain();
        assert_eq!(drained[0].1.value, 2);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_drain_is_key_ordered() {
        let mut outbox = Outbox::new();
        outbox.stage_all(vec![
            ("c".into(), entry(3, 1)),
            ("a".into(), entry(1, 1)),
            ("b".into(), entry(2, 1)),
        ]);
        let keys: Vec<String> = outbox.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_restore_keeps_newer_staged() {
        let mut outbox = Outbox::new();
        outbox.stage("k".into(), entry(1, 1));
        outbox.stage("j".into(), entry(5, 1));
        let failed = outbox.drain();

        // A newer write for "k" lands before the failed batch is restored
        outbox.stage("k".into(), entry(9, 5));
        outbox.restore(failed);

        let drained: BTreeMap<String, i64> = outbox
            .drain()
            .into_iter()
            .map(|(k, e)| (k, e.value))
            .collect();
        assert_eq!(drained.get("k"), Some(&9));
        assert_eq!(drained.get("j"), Some(&5));
    }
}
