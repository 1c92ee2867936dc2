// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot scheduling, incremental writes, integrity checks and restore.
//!
//! # Checksums
//!
//! - item checksum: sha256 of the record's JSON and its write timestamp
//! - collection checksum: sha256 over `id:item_checksum\n` lines in id order
//!
//! A non-forced pass compares each collection checksum with the one last
//! persisted and writes nothing if none moved. Inside a changed collection
//! only rows whose item checksum moved are upserted. In-memory checksums
//! advance only after the transaction commits, so a rolled-back pass is
//! redone in full on the next attempt.
//!
//! # Restore
//!
//! Runs once before the actor starts. Each row is merged into its replica
//! at the write timestamp stored with it, so a restored value competes with
//! peer copies by when it was written. Rows from databases without
//! `written_at` get the lowest timestamp. Rows that no longer decode are
//! skipped and counted; a store that cannot be read restores nothing.

use super::store::{MetaRecord, RecordRow, RecordTable, SnapshotMeta, SnapshotStore, SnapshotWrite, StatRow};
use crate::domain::{AdoptionApplication, Pet};
use crate::error::{MeshError, Result};
use crate::metrics;
use crate::replica::{
    DeltaEntries, Entry, ReplicaHandle, ReplicaValue, Timestamp, APPLICATIONS, COUNTERS, PETS,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

/// sha256 hex over `id:checksum` lines, in id order.
pub fn collection_checksum(items: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (id, checksum) in items {
        hasher.update(id.as_bytes());
        hasher.update(b":");
        hasher.update(checksum.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// sha256 hex of one encoded record together with its write timestamp.
pub fn entry_checksum(data: &str, written_at: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.update(b"\n");
    hasher.update(written_at.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EncodedRow {
    data: String,
    written_at: String,
    checksum: String,
}

/// Encoded collection by id.
type Encoded = BTreeMap<String, EncodedRow>;

fn encode<V: serde::Serialize>(entries: &DeltaEntries<V>) -> Result<Encoded> {
    let mut encoded = BTreeMap::new();
    for (id, entry) in entries {
        let data = serde_json::to_string(&entry.value)?;
        let written_at = entry.ts.to_string();
        let checksum = entry_checksum(&data, &written_at);
        encoded.insert(
            id.clone(),
            EncodedRow {
                data,
                written_at,
                checksum,
            },
        );
    }
    Ok(encoded)
}

fn item_sums(encoded: &Encoded) -> BTreeMap<String, String> {
    encoded
        .iter()
        .map(|(id, row)| (id.clone(), row.checksum.clone()))
        .collect()
}

/// What was last committed for one collection.
#[derive(Debug, Clone, Default)]
struct Persisted {
    checksum: Option<String>,
    items: BTreeMap<String, String>,
}

impl Persisted {
    fn from_items(items: BTreeMap<String, String>) -> Self {
        Self {
            checksum: Some(collection_checksum(&items)),
            items,
        }
    }

    /// Rows of `current` that differ from what was persisted.
    fn changed_ids<'a>(&self, current: &'a Encoded) -> Vec<&'a String> {
        current
            .iter()
            .filter(|(id, row)| self.items.get(*id) != Some(&row.checksum))
            .map(|(id, _)| id)
            .collect()
    }
}

/// Result of a completed snapshot pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub pets_count: usize,
    pub applications_count: usize,
    pub counters_count: usize,
    pub pets_written: usize,
    pub applications_written: usize,
    pub counters_written: usize,
    pub pets_checksum: String,
    pub applications_checksum: String,
    pub incremental: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Nothing changed since the last save.
    NoChanges,
    Saved(SnapshotReport),
}

impl SnapshotOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved(_))
    }
}

/// Integrity of one collection against its last persisted checksums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionIntegrity {
    pub collection: String,
    pub items: usize,
    /// In memory, but persisted with a different checksum or not at all.
    pub mismatched: Vec<String>,
    /// Persisted, but no longer in memory.
    pub missing: Vec<String>,
}

impl CollectionIntegrity {
    pub fn passed(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub collections: Vec<CollectionIntegrity>,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.collections.iter().all(|c| c.passed())
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionIntegrity> {
        self.collections.iter().find(|c| c.collection == name)
    }
}

/// Rows loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub pets: usize,
    pub applications: usize,
    pub counters: usize,
    /// Rows that did not decode.
    pub skipped: usize,
}

impl RestoreSummary {
    pub fn total(&self) -> usize {
        self.pets + self.applications + self.counters
    }
}

enum Command {
    Save {
        force: bool,
        reply: oneshot::Sender<Result<SnapshotOutcome>>,
    },
    Validate {
        reply: oneshot::Sender<Result<IntegrityReport>>,
    },
    Recent {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<SnapshotMeta>>>,
    },
}

/// Cloneable handle to the persistence actor.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<Command>,
}

impl PersistenceHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| MeshError::Shutdown)?;
        rx.await.map_err(|_| MeshError::Shutdown)?
    }

    /// Snapshot now. `force` ignores checksums and writes every row.
    pub async fn save_snapshot(&self, force: bool) -> Result<SnapshotOutcome> {
        self.request(|reply| Command::Save { force, reply }).await
    }

    pub async fn validate_integrity(&self) -> Result<IntegrityReport> {
        self.request(|reply| Command::Validate { reply }).await
    }

    /// Latest snapshot metadata, newest first.
    pub async fn recent_snapshots(&self, limit: usize) -> Result<Vec<SnapshotMeta>> {
        self.request(|reply| Command::Recent { limit, reply }).await
    }
}

/// Sole owner of the snapshot store.
pub struct PersistenceManager {
    node_id: String,
    store: SnapshotStore,
    pets: ReplicaHandle<Pet>,
    applications: ReplicaHandle<AdoptionApplication>,
    counters: ReplicaHandle<i64>,
    persisted: BTreeMap<&'static str, Persisted>,
    committed_once: bool,
}

impl PersistenceManager {
    pub fn new(
        node_id: impl Into<String>,
        store: SnapshotStore,
        pets: ReplicaHandle<Pet>,
        applications: ReplicaHandle<AdoptionApplication>,
        counters: ReplicaHandle<i64>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            pets,
            applications,
            counters,
            persisted: BTreeMap::new(),
            committed_once: false,
        }
    }

    fn persisted_checksum(&self, collection: &str) -> Option<&String> {
        self.persisted.get(collection).and_then(|p| p.checksum.as_ref())
    }

    /// Load the store into the replicas. Never fails; errors restore
    /// nothing.
    pub async fn restore(&mut self) -> RestoreSummary {
        let started = Instant::now();
        match self.try_restore().await {
            Ok(summary) => {
                info!(
                    pets = summary.pets,
                    applications = summary.applications,
                    counters = summary.counters,
                    skipped = summary.skipped,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Restored replica state from snapshot"
                );
                summary
            }
            Err(e) => {
                warn!(error = %e, "Restore failed, starting empty");
                self.persisted.clear();
                RestoreSummary::default()
            }
        }
    }

    async fn try_restore(&mut self) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary::default();

        let rows = self.store.load_records(RecordTable::Pets).await?;
        let (pets, sums, skipped) = decode_rows::<Pet>(PETS, &self.node_id, rows);
        summary.skipped += skipped;
        summary.pets = self.pets.seed(pets).await;
        metrics::record_restore(PETS, summary.pets, skipped);
        self.persisted.insert(PETS, Persisted::from_items(sums));

        let rows = self.store.load_records(RecordTable::Applications).await?;
        let (applications, sums, skipped) =
            decode_rows::<AdoptionApplication>(APPLICATIONS, &self.node_id, rows);
        summary.skipped += skipped;
        summary.applications = self.applications.seed(applications).await;
        metrics::record_restore(APPLICATIONS, summary.applications, skipped);
        self.persisted.insert(APPLICATIONS, Persisted::from_items(sums));

        let stats = self.store.load_stats().await?;
        let rows = stats
            .into_iter()
            .map(|s| RecordRow {
                id: s.key,
                data: s.value,
                checksum: String::new(),
                written_at: s.written_at,
            })
            .collect();
        let (counters, sums, skipped) = decode_rows::<i64>(COUNTERS, &self.node_id, rows);
        summary.skipped += skipped;
        summary.counters = self.counters.seed(counters).await;
        metrics::record_restore(COUNTERS, summary.counters, skipped);
        self.persisted.insert(COUNTERS, Persisted::from_items(sums));

        Ok(summary)
    }

    async fn save_snapshot(&mut self, force: bool) -> Result<SnapshotOutcome> {
        let started = Instant::now();

        let pets = encode(&self.pets.entries().await)?;
        let applications = encode(&self.applications.entries().await)?;
        let counters = encode(&self.counters.entries().await)?;
        let sums = [
            (PETS, item_sums(&pets)),
            (APPLICATIONS, item_sums(&applications)),
            (COUNTERS, item_sums(&counters)),
        ];
        let checksums: BTreeMap<&'static str, String> = sums
            .iter()
            .map(|(name, items)| (*name, collection_checksum(items)))
            .collect();

        let changed = |name: &str| -> bool {
            force || self.persisted_checksum(name) != checksums.get(name)
        };
        let (pets_changed, apps_changed, counters_changed) =
            (changed(PETS), changed(APPLICATIONS), changed(COUNTERS));

        if !pets_changed && !apps_changed && !counters_changed {
            debug!("Snapshot skipped, no changes");
            metrics::record_snapshot("no_changes", started.elapsed());
            return Ok(SnapshotOutcome::NoChanges);
        }

        // The first pass of a process rewrites every row
        let full = force || !self.committed_once;

        let rows_for = |name: &str, encoded: &Encoded, changed: bool| -> Vec<RecordRow> {
            if !changed {
                return Vec::new();
            }
            let ids: Vec<&String> = match self.persisted.get(name) {
                Some(persisted) if !full => persisted.changed_ids(encoded),
                _ => encoded.keys().collect(),
            };
            ids.into_iter()
                .filter_map(|id| {
                    encoded.get(id).map(|row| RecordRow {
                        id: id.clone(),
                        data: row.data.clone(),
                        checksum: row.checksum.clone(),
                        written_at: Some(row.written_at.clone()),
                    })
                })
                .collect()
        };

        let pet_rows = rows_for(PETS, &pets, pets_changed);
        let app_rows = rows_for(APPLICATIONS, &applications, apps_changed);
        let stat_rows: Vec<StatRow> = rows_for(COUNTERS, &counters, counters_changed)
            .into_iter()
            .map(|r| StatRow {
                key: r.id,
                value: r.data,
                written_at: r.written_at,
            })
            .collect();

        let checksum_of = |name: &str| checksums.get(name).cloned().unwrap_or_default();
        let report = SnapshotReport {
            pets_count: pets.len(),
            applications_count: applications.len(),
            counters_count: counters.len(),
            pets_written: pet_rows.len(),
            applications_written: app_rows.len(),
            counters_written: stat_rows.len(),
            pets_checksum: checksum_of(PETS),
            applications_checksum: checksum_of(APPLICATIONS),
            incremental: !full,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let write = SnapshotWrite {
            pets: pet_rows,
            applications: app_rows,
            stats: stat_rows,
            meta: Some(MetaRecord {
                node: self.node_id.clone(),
                pets_count: report.pets_count as i64,
                apps_count: report.applications_count as i64,
                stats_count: report.counters_count as i64,
                pets_checksum: report.pets_checksum.clone(),
                apps_checksum: report.applications_checksum.clone(),
                stats_checksum: checksum_of(COUNTERS),
                duration_ms: report.duration_ms as i64,
                incremental: report.incremental,
            }),
        };

        if let Err(e) = self.store.write_snapshot(&write).await {
            warn!(error = %e, "Snapshot failed, transaction rolled back");
            metrics::record_snapshot("failed", started.elapsed());
            return Err(e);
        }

        for (name, items) in sums {
            self.persisted.insert(name, Persisted::from_items(items));
        }
        self.committed_once = true;

        metrics::record_snapshot_rows(PETS, report.pets_written);
        metrics::record_snapshot_rows(APPLICATIONS, report.applications_written);
        metrics::record_snapshot_rows(COUNTERS, report.counters_written);
        metrics::record_snapshot("saved", started.elapsed());
        info!(
            pets = report.pets_count,
            applications = report.applications_count,
            written = report.pets_written + report.applications_written + report.counters_written,
            incremental = report.incremental,
            duration_ms = report.duration_ms,
            "Snapshot saved"
        );
        Ok(SnapshotOutcome::Saved(report))
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        let current = [
            (PETS, item_sums(&encode(&self.pets.entries().await)?)),
            (APPLICATIONS, item_sums(&encode(&self.applications.entries().await)?)),
            (COUNTERS, item_sums(&encode(&self.counters.entries().await)?)),
        ];

        let empty = Persisted::default();
        let mut collections = Vec::with_capacity(current.len());
        for (name, items) in current {
            let persisted = self.persisted.get(name).unwrap_or(&empty);
            let mismatched: Vec<String> = items
                .iter()
                .filter(|(id, sum)| persisted.items.get(*id) != Some(sum))
                .map(|(id, _)| id.clone())
                .collect();
            let missing: Vec<String> = persisted
                .items
                .keys()
                .filter(|id| !items.contains_key(*id))
                .cloned()
                .collect();
            let check = CollectionIntegrity {
                collection: name.to_string(),
                items: items.len(),
                mismatched,
                missing,
            };
            metrics::record_integrity_check(name, check.passed());
            if !check.passed() {
                warn!(
                    collection = name,
                    mismatched = check.mismatched.len(),
                    missing = check.missing.len(),
                    "Integrity check failed"
                );
            }
            collections.push(check);
        }
        Ok(IntegrityReport { collections })
    }

    /// Start the actor. Automatic snapshots run every `interval` when
    /// `enabled`; the first run is one interval after start.
    pub fn spawn(
        self,
        interval: Duration,
        enabled: bool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (PersistenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let span = info_span!("persistence", node_id = %self.node_id);
        let task = tokio::spawn(self.run(rx, interval, enabled, shutdown_rx).instrument(span));
        (PersistenceHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        interval: Duration,
        enabled: bool,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = timer.tick(), if enabled => {
                    // Failures are logged inside; the next tick tries again
                    let _ = self.save_snapshot(false).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        self.store.close().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Save { force, reply } => {
                let _ = reply.send(self.save_snapshot(force).await);
            }
            Command::Validate { reply } => {
                let _ = reply.send(self.validate_integrity().await);
            }
            Command::Recent { limit, reply } => {
                let _ = reply.send(self.store.recent_meta(limit).await);
            }
        }
    }
}

/// Write time of a stored row. Missing or unreadable values fall back to
/// [`Timestamp::restored`].
fn row_timestamp(collection: &str, node_id: &str, row: &RecordRow) -> Timestamp {
    match row.written_at.as_deref().map(str::parse::<Timestamp>) {
        Some(Ok(ts)) => ts,
        Some(Err(e)) => {
            warn!(collection, id = %row.id, error = %e, "Unreadable write time, restoring as oldest");
            Timestamp::restored(node_id)
        }
        None => Timestamp::restored(node_id),
    }
}

fn decode_rows<V: ReplicaValue>(
    collection: &str,
    node_id: &str,
    rows: Vec<RecordRow>,
) -> (DeltaEntries<V>, BTreeMap<String, String>, usize) {
    let mut entries = Vec::with_capacity(rows.len());
    let mut sums = BTreeMap::new();
    let mut skipped = 0;
    for row in rows {
        match serde_json::from_str::<V>(&row.data) {
            Ok(value) => {
                let ts = row_timestamp(collection, node_id, &row);
                let checksum = if row.checksum.is_empty() {
                    entry_checksum(&row.data, row.written_at.as_deref().unwrap_or_default())
                } else {
                    row.checksum
                };
                sums.insert(row.id.clone(), checksum);
                entries.push((row.id, Entry::new(value, ts)));
            }
            Err(e) => {
                warn!(collection, id = %row.id, error = %e, "Skipping undecodable row");
                skipped += 1;
            }
        }
    }
    (entries, sums, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_checksum_covers_data_and_write_time() {
        let sum = entry_checksum("{}", "1.0@n1");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sum, entry_checksum("{ }", "1.0@n1"));
        assert_ne!(sum, entry_checksum("{}", "2.0@n1"));
    }

    #[test]
    fn test_collection_checksum_depends_on_ids_and_sums() {
        let mut a = BTreeMap::new();
        a.insert("p1".to_string(), "x".to_string());
        let mut b = a.clone();
        assert_eq!(collection_checksum(&a), collection_checksum(&b));

        b.insert("p1".to_string(), "y".to_string());
        assert_ne!(collection_checksum(&a), collection_checksum(&b));

        let mut c = BTreeMap::new();
        c.insert("p2".to_string(), "x".to_string());
        assert_ne!(collection_checksum(&a), collection_checksum(&c));
    }

    #[test]
    fn test_changed_ids() {
        let mut items = BTreeMap::new();
        items.insert("p1".to_string(), "s1".to_string());
        items.insert("p2".to_string(), "s2".to_string());
        let persisted = Persisted::from_items(items);

        let mut current: Encoded = BTreeMap::new();
        let row = |sum: &str| EncodedRow {
            data: "{}".into(),
            written_at: "1.0@n1".into(),
            checksum: sum.into(),
        };
        current.insert("p1".into(), row("s1"));
        current.insert("p2".into(), row("s2-new"));
        current.insert("p3".into(), row("s3"));

        let changed: Vec<&String> = persisted.changed_ids(&current);
        assert_eq!(changed, vec!["p2", "p3"]);
    }

    #[test]
    fn test_decode_rows_skips_bad_rows() {
        let rows = vec![
            RecordRow {
                id: "total_adoptions".into(),
                data: "3".into(),
                checksum: String::new(),
                written_at: Some("40.2@south".into()),
            },
            RecordRow {
                id: "broken".into(),
                data: "\"not a number\"".into(),
                checksum: "x".into(),
                written_at: None,
            },
        ];
        let (entries, sums, skipped) = decode_rows::<i64>("counters", "north", rows);
        assert_eq!(
            entries,
            vec![(
                "total_adoptions".to_string(),
                Entry::new(3, Timestamp::new(40, 2, "south"))
            )]
        );
        assert_eq!(
            sums.get("total_adoptions"),
            Some(&entry_checksum("3", "40.2@south"))
        );
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_rows_without_write_time_restore_as_oldest() {
        let row = |written_at: Option<&str>| RecordRow {
            id: "p1".into(),
            data: "1".into(),
            checksum: "c".into(),
            written_at: written_at.map(String::from),
        };
        assert_eq!(
            row_timestamp("pets", "north", &row(None)),
            Timestamp::restored("north")
        );
        assert_eq!(
            row_timestamp("pets", "north", &row(Some("garbage"))),
            Timestamp::restored("north")
        );
        assert_eq!(
            row_timestamp("pets", "north", &row(Some("9.1@east"))),
            Timestamp::new(9, 1, "east")
        );
    }

    #[test]
    fn test_integrity_report_passed() {
        let ok = CollectionIntegrity {
            collection: "pets".into(),
            items: 1,
            mismatched: vec![],
            missing: vec![],
        };
        let bad = CollectionIntegrity {
            collection: "applications".into(),
            items: 1,
            mismatched: vec!["a1".into()],
            missing: vec![],
        };
        let report = IntegrityReport {
            collections: vec![ok.clone(), bad],
        };
        assert!(!report.passed());
        assert!(report.collection("pets").unwrap().passed());
        assert!(IntegrityReport { collections: vec![ok] }.passed());
    }
}
