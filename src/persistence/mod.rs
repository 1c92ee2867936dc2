// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot persistence and recovery.
//!
//! - [`store`]: the SQLite schema and batched writes
//! - [`manager`]: checksums, scheduling, integrity checks and restore

pub mod manager;
pub mod store;

pub use manager::{
    collection_checksum, entry_checksum, CollectionIntegrity, IntegrityReport, PersistenceHandle,
    PersistenceManager, RestoreSummary, SnapshotOutcome, SnapshotReport,
};
pub use store::{MetaRecord, RecordTable, SnapshotMeta, SnapshotStore};
