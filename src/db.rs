//! Local SQLite persistence for the sync engine.
//!
//! Uses rusqlite with WAL mode. Holds the reference-data caches with their
//! version cursors, the offline-order queue and a small settings table.
//! Every dataset page is committed in a single transaction together with its
//! cursor, so the stored cursor never runs ahead of the stored data.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::cart::model::OrderSnapshot;
use crate::error::{Result, SyncError};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const TERMINAL_CATEGORY: &str = "terminal";

/// Shared handle to the local database.
pub struct LocalStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetVersionRecord {
    pub key: String,
    pub version: String,
    pub synced_at: String,
}

/// One page of a dataset response, ready to commit.
#[derive(Debug, Clone, Default)]
pub struct PageCommit<'a> {
    pub records: &'a [Value],
    /// Applied only when non-empty; callers pass deletions for the first page only.
    pub deleted_ids: &'a [String],
    pub next_version: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageStats {
    /// Rows inserted or changed; identical re-applied rows are not counted.
    pub upserted: usize,
    pub deleted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineOrderStatus {
    Pending,
    Conflict,
    Failed,
}

impl OfflineOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OfflineOrderStatus::Pending => "pending",
            OfflineOrderStatus::Conflict => "conflict",
            OfflineOrderStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "conflict" => OfflineOrderStatus::Conflict,
            "failed" => OfflineOrderStatus::Failed,
            _ => OfflineOrderStatus::Pending,
        }
    }
}

/// A finished order waiting for ingestion. Deleted only after the server
/// acknowledged it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineOrderRecord {
    pub local_id: String,
    pub idempotency_key: String,
    /// Set when the order existed online before the terminal went offline.
    pub server_order_id: Option<String>,
    pub order: OrderSnapshot,
    pub status: OfflineOrderStatus,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QueueStats {
    pub pending: u32,
    pub conflicted: u32,
    pub failed: u32,
    /// Value of completed sales not yet acknowledged by the server.
    pub exposure: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalIdentity {
    pub terminal_id: String,
    pub branch_id: Option<String>,
}

impl LocalStore {
    /// Open (or create) `{data_dir}/pos-sync.db` and run pending migrations.
    ///
    /// Unlike a disposable cache, this file holds unsynced sales, so an open
    /// failure is reported instead of deleting the file and starting over.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("pos-sync.db");
        info!("Opening database at {}", db_path.display());

        let conn = open_and_configure(&db_path)?;
        run_migrations(&conn)?;

        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }

    // -----------------------------------------------------------------------
    // Dataset caches
    // -----------------------------------------------------------------------

    /// Upsert records, apply deletions and advance the cursor atomically.
    pub fn commit_dataset_page(&self, key: &str, page: &PageCommit<'_>) -> Result<PageStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut stats = PageStats::default();

        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO dataset_records (dataset, record_id, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(dataset, record_id) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at
                 WHERE dataset_records.data <> excluded.data",
            )?;
            for record in page.records {
                let Some(record_id) = record_id(record) else {
                    stats.skipped += 1;
                    continue;
                };
                let data = serde_json::to_string(record)?;
                stats.upserted += upsert.execute(params![key, record_id, data, now])?;
            }

            let mut delete = tx.prepare_cached(
                "DELETE FROM dataset_records WHERE dataset = ?1 AND record_id = ?2",
            )?;
            for id in page.deleted_ids {
                stats.deleted += delete.execute(params![key, id])?;
            }

            if let Some(version) = page.next_version {
                tx.execute(
                    "INSERT INTO dataset_versions (key, version, synced_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        version = excluded.version,
                        synced_at = excluded.synced_at",
                    params![key, version, now],
                )?;
            }
        }

        tx.commit()?;
        debug!(
            dataset = key,
            upserted = stats.upserted,
            deleted = stats.deleted,
            skipped = stats.skipped,
            "dataset page committed"
        );
        Ok(stats)
    }

    /// Replace-style cache write used for a full snapshot of a dataset.
    pub fn cache_dataset(
        &self,
        key: &str,
        records: &[Value],
        version: Option<&str>,
    ) -> Result<PageStats> {
        self.commit_dataset_page(
            key,
            &PageCommit {
                records,
                deleted_ids: &[],
                next_version: version,
            },
        )
    }

    pub fn delete_records(&self, key: &str, ids: &[String]) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("DELETE FROM dataset_records WHERE dataset = ?1 AND record_id = ?2")?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute(params![key, id])?;
        }
        Ok(deleted)
    }

    pub fn dataset_version(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT version FROM dataset_versions WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_all_dataset_versions(&self) -> Result<Vec<DatasetVersionRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key, version, synced_at FROM dataset_versions ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok(DatasetVersionRecord {
                key: row.get(0)?,
                version: row.get(1)?,
                synced_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn read_dataset(&self, key: &str) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT data FROM dataset_records WHERE dataset = ?1 ORDER BY record_id")?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(serde_json::from_str(&raw?)?);
        }
        Ok(records)
    }

    pub fn find_record(&self, key: &str, record_id: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM dataset_records WHERE dataset = ?1 AND record_id = ?2",
                params![key, record_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(SyncError::from))
            .transpose()
    }

    pub fn count_records(&self, key: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dataset_records WHERE dataset = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Offline order queue
    // -----------------------------------------------------------------------

    /// Insert a finished order. Returns false when the idempotency key is
    /// already queued.
    pub fn save_offline_order(&self, record: &OfflineOrderRecord) -> Result<bool> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&record.order)?;
        let exposure = if record.order.status == crate::cart::model::OrderStatus::Completed {
            record.order.totals.total
        } else {
            0.0
        };
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO offline_orders
                (local_id, idempotency_key, server_order_id, payload, order_status, status,
                 total, last_error, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.local_id,
                record.idempotency_key,
                record.server_order_id,
                payload,
                record.order.status.as_str(),
                record.status.as_str(),
                exposure,
                record.last_error,
                record.attempts,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 1 {
            info!(local_id = %record.local_id, total = exposure, "offline order queued");
        }
        Ok(inserted == 1)
    }

    /// Oldest first. `None` lists every status.
    pub fn list_offline_orders(
        &self,
        status: Option<OfflineOrderStatus>,
    ) -> Result<Vec<OfflineOrderRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT local_id, idempotency_key, server_order_id, payload, status,
                    last_error, attempts, created_at, updated_at
             FROM offline_orders
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at, local_id",
        )?;
        let rows = stmt.query_map(params![status.map(OfflineOrderStatus::as_str)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                local_id,
                idempotency_key,
                server_order_id,
                payload,
                status,
                last_error,
                attempts,
                created,
                updated,
            ) = row?;
            records.push(OfflineOrderRecord {
                local_id,
                idempotency_key,
                server_order_id,
                order: serde_json::from_str(&payload)?,
                status: OfflineOrderStatus::parse(&status),
                last_error,
                attempts,
                created_at: parse_timestamp(&created),
                updated_at: parse_timestamp(&updated),
            });
        }
        Ok(records)
    }

    pub fn delete_offline_order(&self, local_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted =
            conn.execute("DELETE FROM offline_orders WHERE local_id = ?1", params![local_id])?;
        Ok(deleted == 1)
    }

    /// Record a submission attempt and its outcome.
    pub fn mark_offline_order_status(
        &self,
        local_id: &str,
        status: OfflineOrderStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE offline_orders
             SET status = ?2, last_error = ?3, attempts = attempts + 1, updated_at = ?4
             WHERE local_id = ?1",
            params![local_id, status.as_str(), last_error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let (pending, conflicted, failed, exposure) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'conflict' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(total), 0.0)
             FROM offline_orders",
            [],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            },
        )?;
        Ok(QueueStats {
            pending,
            conflicted,
            failed,
            exposure: crate::money::round_money(exposure),
        })
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn local_setting_get(&self, category: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT setting_value FROM local_settings
                 WHERE setting_category = ?1 AND setting_key = ?2",
                params![category, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn local_setting_set(&self, category: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(setting_category, setting_key) DO UPDATE SET
                setting_value = excluded.setting_value,
                updated_at = excluded.updated_at",
            params![category, key, value],
        )?;
        Ok(())
    }

    /// Non-secret terminal identity mirrored from the keyring at pairing time.
    pub fn get_pairing_info(&self) -> Result<Option<TerminalIdentity>> {
        let Some(terminal_id) = self.local_setting_get(TERMINAL_CATEGORY, "terminal_id")? else {
            return Ok(None);
        };
        Ok(Some(TerminalIdentity {
            terminal_id,
            branch_id: self.local_setting_get(TERMINAL_CATEGORY, "branch_id")?,
        }))
    }

    pub fn set_pairing_info(&self, identity: &TerminalIdentity) -> Result<()> {
        self.local_setting_set(TERMINAL_CATEGORY, "terminal_id", &identity.terminal_id)?;
        if let Some(branch_id) = &identity.branch_id {
            self.local_setting_set(TERMINAL_CATEGORY, "branch_id", branch_id)?;
        }
        Ok(())
    }
}

/// Records are keyed by their `id` field (string or number).
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");
    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

/// Migration v1: settings and reference-data caches.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS dataset_versions (
            key TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            synced_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dataset_records (
            dataset TEXT NOT NULL,
            record_id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (dataset, record_id)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .inspect_err(|e| error!("Migration v1 failed: {e}"))?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: offline order queue.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS offline_orders (
            local_id TEXT PRIMARY KEY,
            idempotency_key TEXT UNIQUE NOT NULL,
            server_order_id TEXT,
            payload TEXT NOT NULL,
            order_status TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'conflict', 'failed')),
            total REAL NOT NULL DEFAULT 0,
            last_error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_offline_orders_status ON offline_orders(status, created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .inspect_err(|e| error!("Migration v2 failed: {e}"))?;

    info!("Applied migration v2 (offline order queue)");
    Ok(())
}
