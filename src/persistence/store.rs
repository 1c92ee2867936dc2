// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite snapshot store.
//!
//! One table per collection plus an append-only `snapshot_meta` audit log:
//!
//! ```text
//! pets(id PK, data, checksum, updated_at, written_at)
//! applications(id PK, data, checksum, updated_at, written_at)
//! stats(key PK, value, updated_at, written_at)
//! snapshot_meta(id PK AUTOINCREMENT, snapshot_at, node, pets_count, apps_count,
//!               pets_checksum, apps_checksum, duration_ms, incremental, ...)
//! ```
//!
//! `data` holds the record as JSON. `written_at` is the replicated write
//! timestamp (`wall.counter@node`), NULL in databases from before it was
//! recorded. Newer columns are added in place on open (additive migrations
//! only).
//!
//! # Writes
//!
//! A snapshot pass is one transaction: batched multi-row upserts for every
//! collection, the metadata row, then pruning of old metadata. Any error
//! rolls the whole pass back.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED is retried with capped exponential backoff
//! (5 attempts, 10ms doubling to 500ms).

use crate::config::SnapshotConfig;
use crate::error::{MeshError, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path value selecting a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Columns added after the initial schema, as (table, column, definition).
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("snapshot_meta", "stats_count", "INTEGER NOT NULL DEFAULT 0"),
    ("snapshot_meta", "stats_checksum", "TEXT"),
    ("pets", "written_at", "TEXT"),
    ("applications", "written_at", "TEXT"),
    ("stats", "written_at", "TEXT"),
];

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Tables holding full records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTable {
    Pets,
    Applications,
}

impl RecordTable {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pets => "pets",
            Self::Applications => "applications",
        }
    }
}

/// A row of `pets` or `applications`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub id: String,
    pub data: String,
    pub checksum: String,
    pub written_at: Option<String>,
}

/// A row of `stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRow {
    pub key: String,
    pub value: String,
    pub written_at: Option<String>,
}

/// Metadata recorded with each snapshot pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub node: String,
    pub pets_count: i64,
    pub apps_count: i64,
    pub stats_count: i64,
    pub pets_checksum: String,
    pub apps_checksum: String,
    pub stats_checksum: String,
    pub duration_ms: i64,
    pub incremental: bool,
}

/// A stored `snapshot_meta` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub id: i64,
    pub snapshot_at: String,
    pub record: MetaRecord,
}

/// Everything one snapshot pass writes.
#[derive(Debug, Clone, Default)]
pub struct SnapshotWrite {
    pub pets: Vec<RecordRow>,
    pub applications: Vec<RecordRow>,
    pub stats: Vec<StatRow>,
    pub meta: Option<MetaRecord>,
}

/// SQLite-backed snapshot storage. Only the persistence manager holds one.
pub struct SnapshotStore {
    pool: SqlitePool,
    path: String,
    batch_size: usize,
    retain_meta: usize,
}

impl SnapshotStore {
    /// Open (creating if needed) the store described by `config`.
    ///
    /// Fails with [`MeshError::Config`] when the storage directory cannot be
    /// created.
    pub async fn open(config: &SnapshotConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Initializing snapshot store");

        let pool = if path == IN_MEMORY {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| MeshError::Config(format!("Invalid SQLite path: {}", e)))?;
            // A second connection would see a different empty database
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        MeshError::Config(format!(
                            "Cannot create snapshot directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
                .map_err(|e| MeshError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(2)
                .connect_with(options)
                .await?
        };

        let store = Self {
            pool,
            path,
            batch_size: config.batch_size.max(1),
            retain_meta: config.retain_meta.max(1),
        };
        store.init_schema().await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for table in [RecordTable::Pets, RecordTable::Applications] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    data TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                table.name()
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stats (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshot_meta (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_at TEXT NOT NULL,
                node TEXT NOT NULL,
                pets_count INTEGER NOT NULL,
                apps_count INTEGER NOT NULL,
                pets_checksum TEXT,
                apps_checksum TEXT,
                duration_ms INTEGER NOT NULL,
                incremental INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Add any columns missing from an older database.
    async fn migrate(&self) -> Result<()> {
        for (table, column, definition) in ADDITIVE_COLUMNS {
            let columns: Vec<String> = sqlx::query(&format!("PRAGMA table_info({})", table))
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| row.get::<String, _>("name"))
                .collect();
            if columns.iter().any(|c| c == column) {
                continue;
            }
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))
            .execute(&self.pool)
            .await?;
            info!(table, column, "Added column");
        }
        Ok(())
    }

    pub async fn load_records(&self, table: RecordTable) -> Result<Vec<RecordRow>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(&format!(
            "SELECT id, data, checksum, written_at FROM {} ORDER BY id",
            table.name()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, data, checksum, written_at)| RecordRow {
                id,
                data,
                checksum,
                written_at,
            })
            .collect())
    }

    pub async fn load_stats(&self) -> Result<Vec<StatRow>> {
        let rows: Vec<(String, String, Option<String>)> =
            sqlx::query_as("SELECT key, value, written_at FROM stats ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(key, value, written_at)| StatRow {
                key,
                value,
                written_at,
            })
            .collect())
    }

    /// Write one snapshot pass atomically.
    pub async fn write_snapshot(&self, write: &SnapshotWrite) -> Result<()> {
        execute_with_retry("snapshot_write", || self.write_once(write)).await?;
        Ok(())
    }

    async fn write_once(&self, write: &SnapshotWrite) -> std::result::Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        for (table, rows) in [
            (RecordTable::Pets, &write.pets),
            (RecordTable::Applications, &write.applications),
        ] {
            for chunk in rows.chunks(self.batch_size) {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                    "INSERT INTO {} (id, data, checksum, updated_at, written_at) ",
                    table.name()
                ));
                qb.push_values(chunk, |mut b, row| {
                    b.push_bind(row.id.clone())
                        .push_bind(row.data.clone())
                        .push_bind(row.checksum.clone())
                        .push_bind(now.clone())
                        .push_bind(row.written_at.clone());
                });
                qb.push(
                    " ON CONFLICT(id) DO UPDATE SET data = excluded.data, \
                     checksum = excluded.checksum, updated_at = excluded.updated_at, \
                     written_at = excluded.written_at",
                );
                qb.build().execute(&mut *tx).await?;
            }
        }

        for chunk in write.stats.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO stats (key, value, updated_at, written_at) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.key.clone())
                    .push_bind(row.value.clone())
                    .push_bind(now.clone())
                    .push_bind(row.written_at.clone());
            });
            qb.push(
                " ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 updated_at = excluded.updated_at, written_at = excluded.written_at",
            );
            qb.build().execute(&mut *tx).await?;
        }

        if let Some(meta) = &write.meta {
            sqlx::query(
                r#"
                INSERT INTO snapshot_meta (
                    snapshot_at, node, pets_count, apps_count, pets_checksum,
                    apps_checksum, duration_ms, incremental, stats_count, stats_checksum
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&now)
            .bind(&meta.node)
            .bind(meta.pets_count)
            .bind(meta.apps_count)
            .bind(&meta.pets_checksum)
            .bind(&meta.apps_checksum)
            .bind(meta.duration_ms)
            .bind(meta.incremental as i64)
            .bind(meta.stats_count)
            .bind(&meta.stats_checksum)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "DELETE FROM snapshot_meta WHERE id NOT IN \
                 (SELECT id FROM snapshot_meta ORDER BY id DESC LIMIT ?)",
            )
            .bind(self.retain_meta as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    /// Most recent metadata rows, newest first.
    pub async fn recent_meta(&self, limit: usize) -> Result<Vec<SnapshotMeta>> {
        let rows = sqlx::query(
            r#"
            SELECT id, snapshot_at, node, pets_count, apps_count, pets_checksum,
                   apps_checksum, duration_ms, incremental, stats_count, stats_checksum
            FROM snapshot_meta ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SnapshotMeta {
                id: row.get("id"),
                snapshot_at: row.get("snapshot_at"),
                record: MetaRecord {
                    node: row.get("node"),
                    pets_count: row.get("pets_count"),
                    apps_count: row.get("apps_count"),
                    stats_count: row.get("stats_count"),
                    pets_checksum: row
                        .get::<Option<String>, _>("pets_checksum")
                        .unwrap_or_default(),
                    apps_checksum: row
                        .get::<Option<String>, _>("apps_checksum")
                        .unwrap_or_default(),
                    stats_checksum: row
                        .get::<Option<String>, _>("stats_checksum")
                        .unwrap_or_default(),
                    duration_ms: row.get("duration_ms"),
                    incremental: row.get::<i64, _>("incremental") != 0,
                },
            })
            .collect())
    }

    pub async fn meta_count(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM snapshot_meta")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("store_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Snapshot store closed");
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
