// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-writer-wins map.
//!
//! Every entry carries the [`Timestamp`] of the write that produced it.
//! Merging keeps an incoming entry only when its timestamp is strictly
//! greater than the one held, which makes merge idempotent, commutative and
//! insensitive to delivery order.

use super::clock::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A value and the timestamp of the write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    pub value: V,
    pub ts: Timestamp,
}

impl<V> Entry<V> {
    pub fn new(value: V, ts: Timestamp) -> Self {
        Self { value, ts }
    }
}

/// Wire form of a delta: keyed entries, sorted by key.
pub type DeltaEntries<V> = Vec<(String, Entry<V>)>;

#[derive(Debug, Clone, PartialEq)]
pub struct LwwMap<V> {
    entries: BTreeMap<String, Entry<V>>,
}

impl<V> Default for LwwMap<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V: Clone> LwwMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local write. The caller's clock guarantees `ts` is newer
    /// than anything held.
    pub fn insert_local(&mut self, key: impl Into<String>, value: V, ts: Timestamp) -> Entry<V> {
        let entry = Entry::new(value, ts);
        self.entries.insert(key.into(), entry.clone());
        entry
    }

    /// Merge one entry. Returns `true` if local state changed.
    pub fn merge_entry(&mut self, key: String, incoming: Entry<V>) -> bool {
        match self.entries.get(&key) {
            Some(current) if current.ts >= incoming.ts => false,
            _ => {
                self.entries.insert(key, incoming);
                true
            }
        }
    }

    /// Merge a delta. Returns the keys whose value changed, in key order.
    pub fn merge(&mut self, delta: DeltaEntries<V>) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, entry) in delta {
            if self.merge_entry(key.clone(), entry) {
                changed.push(key);
            }
        }
        changed.sort();
        changed.dedup();
        changed
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&Entry<V>> {
        self.entries.get(key)
    }

    /// Point-in-time copy of all values.
    pub fn snapshot(&self) -> BTreeMap<String, V> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Full state as a delta (used to bring a new neighbor up to date).
    pub fn entries(&self) -> DeltaEntries<V> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Structural hash over keys and timestamps.
    ///
    /// Two maps with the same keys at the same timestamps hold the same
    /// values, so values are not hashed.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, entry) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.ts.wall_ms.to_be_bytes());
            hasher.update(entry.ts.counter.to_be_bytes());
            hasher.update(entry.ts.node.as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: u64, node: &str) -> Timestamp {
        Timestamp::new(wall, 0, node)
    }

    #[test]
    fn test_insert_and_get() {
        let mut map = LwwMap::new();
        map.insert_local("a", 1, ts(1, "n1"));
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.get("b"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_merge_later_wins() {
        let mut map = LwwMap::new();
        map.insert_local("a", "old", ts(1, "n1"));

        let changed = map.merge(vec![("a".into(), Entry::new("new", ts(2, "n2")))]);
        assert_eq!(changed, vec!["a".to_string()]);
        assert_eq!(map.get("a"), Some(&"new"));
    }

    #[test]
    fn test_merge_older_ignored() {
        let mut map = LwwMap::new();
        map.insert_local("a", "new", ts(5, "n1"));

        let changed = map.merge(vec![("a".into(), Entry::new("old", ts(4, "n2")))]);
        assert!(changed.is_empty());
        assert_eq!(map.get("a"), Some(&"new"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let delta = vec![
            ("a".to_string(), Entry::new(1, ts(3, "n2"))),
            ("b".to_string(), Entry::new(2, ts(4, "n2"))),
        ];
        let mut map = LwwMap::new();
        assert_eq!(map.merge(delta.clone()).len(), 2);
        let once = map.clone();
        assert!(map.merge(delta).is_empty());
        assert_eq!(map, once);
    }

    #[test]
    fn test_tie_break_by_node() {
        let a = ("k".to_string(), Entry::new("from-a", Timestamp::new(7, 0, "node-a")));
        let b = ("k".to_string(), Entry::new("from-b", Timestamp::new(7, 0, "node-b")));

        let mut left = LwwMap::new();
        left.merge(vec![a.clone(), b.clone()]);
        let mut right = LwwMap::new();
        right.merge(vec![b, a]);

        assert_eq!(left.get("k"), Some(&"from-b"));
        assert_eq!(left, right);
    }

    #[test]
    fn test_content_hash_tracks_timestamps() {
        let mut map = LwwMap::new();
        let empty = map.content_hash();
        map.insert_local("a", 1, ts(1, "n1"));
        let one = map.content_hash();
        assert_ne!(empty, one);

        // Same key, newer write
        map.insert_local("a", 1, ts(2, "n1"));
        assert_ne!(one, map.content_hash());

        let mut other = LwwMap::new();
        other.insert_local("a", 1, ts(2, "n1"));
        assert_eq!(other.content_hash(), map.content_hash());
    }

    #[test]
    fn test_snapshot_and_entries() {
        let mut map = LwwMap::new();
        map.insert_local("b", 2, ts(1, "n1"));
        map.insert_local("a", 1, ts(2, "n1"));

        let snapshot = map.snapshot();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        let entries = map.entries();
        assert_eq!(entries[0].0, "a");
        assert_eq!(entries[1].1.value, 2);
    }
}
