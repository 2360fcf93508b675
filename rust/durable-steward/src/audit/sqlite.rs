//! `SQLite` backend for the audit log.
//!
//! Entries live in a single `audit_log` table keyed by sequence number.
//! Appends run inside `BEGIN IMMEDIATE` so the `MAX(sequence) + 1`
//! assignment cannot race with another writer on the same file.
//!
//! ```rust,ignore
//! use durable_steward::audit::SqliteAuditLog;
//!
//! let log = SqliteAuditLog::open("./data/audit.db").await?;
//! let entry = log.append(new_entry).await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use tokio::task;

use super::{AuditEntry, AuditEventType, AuditLog, NewAuditEntry};

/// Columns of one `audit_log` row, in select order.
type RawRow = (i64, String, Option<String>, Option<String>, Option<i64>, String, String);

/// SQLite-backed append-only audit log.
///
/// A single connection is shared behind a mutex and used from the blocking
/// thread pool.
#[derive(Debug, Clone)]
pub struct SqliteAuditLog {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteAuditLog {
    /// Open (or create) an audit log at `path`. `:memory:` gives a private
    /// in-memory database.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let db_path = path.into();
        let open_path = db_path.clone();

        let conn = task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&open_path)
                .with_context(|| format!("Failed to open audit database at {}", open_path.display()))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("Failed to enable WAL mode")?;
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS audit_log (
                    sequence INTEGER PRIMARY KEY,
                    timestamp TEXT NOT NULL,
                    instance_id TEXT,
                    policy_id TEXT,
                    policy_version INTEGER,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_audit_log_instance
                    ON audit_log(instance_id, sequence);
                ",
            )
            .context("Failed to create audit_log table")?;
            Ok(conn)
        })
        .await
        .context("Failed to spawn blocking task")??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    /// Path of the backing database.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.db_path
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<RawRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }

    fn decode(raw: RawRow) -> Result<AuditEntry> {
        let (sequence, timestamp, instance_id, policy_id, policy_version, event_type, payload) = raw;
        Ok(AuditEntry {
            sequence_number: u64::try_from(sequence).context("Negative audit sequence")?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .context("Invalid audit timestamp")?
                .with_timezone(&Utc),
            instance_id,
            policy_id,
            policy_version: policy_version
                .map(u32::try_from)
                .transpose()
                .context("Invalid policy version")?,
            event_type: event_type.parse::<AuditEventType>()?,
            payload: serde_json::from_str(&payload).context("Invalid audit payload")?,
        })
    }

    async fn query(&self, sql: &'static str, args: Vec<rusqlite::types::Value>) -> Result<Vec<AuditEntry>> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || -> Result<Vec<AuditEntry>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare_cached(sql).context("Failed to prepare audit query")?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), Self::row_to_entry)
                .context("Failed to execute audit query")?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(Self::decode(row.context("Failed to read audit row")?)?);
            }
            Ok(entries)
        })
        .await
        .context("Failed to spawn blocking task")?
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let conn = Arc::clone(&self.conn);
        let payload = serde_json::to_string(&entry.payload).context("Failed to serialize payload")?;

        task::spawn_blocking(move || -> Result<AuditEntry> {
            let conn = conn.lock();
            conn.execute("BEGIN IMMEDIATE", [])
                .context("Failed to begin transaction")?;

            let next_seq: i64 = match conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM audit_log",
                [],
                |row| row.get(0),
            ) {
                Ok(seq) => seq,
                Err(e) => {
                    conn.execute("ROLLBACK", []).ok();
                    return Err(e).context("Failed to get next sequence number");
                }
            };

            let now = Utc::now();
            if let Err(e) = conn.execute(
                r"
                INSERT INTO audit_log
                    (sequence, timestamp, instance_id, policy_id, policy_version, event_type, payload)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    next_seq,
                    now.to_rfc3339(),
                    entry.instance_id,
                    entry.policy_id,
                    entry.policy_version.map(i64::from),
                    entry.event_type.as_str(),
                    payload,
                ],
            ) {
                conn.execute("ROLLBACK", []).ok();
                return Err(e).context("Failed to insert audit entry");
            }

            conn.execute("COMMIT", []).context("Failed to commit transaction")?;

            let sequence = u64::try_from(next_seq).context("Negative audit sequence")?;
            Ok(entry.into_entry(sequence, now))
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    async fn read_from(&self, sequence_number: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let from = i64::try_from(sequence_number).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(
            r"
            SELECT sequence, timestamp, instance_id, policy_id, policy_version, event_type, payload
            FROM audit_log WHERE sequence >= ?1 ORDER BY sequence ASC LIMIT ?2
            ",
            vec![from.into(), limit.into()],
        )
        .await
    }

    async fn for_instance(&self, instance_id: &str) -> Result<Vec<AuditEntry>> {
        self.query(
            r"
            SELECT sequence, timestamp, instance_id, policy_id, policy_version, event_type, payload
            FROM audit_log WHERE instance_id = ?1 ORDER BY sequence ASC
            ",
            vec![instance_id.to_string().into()],
        )
        .await
    }

    async fn last_sequence(&self) -> Result<u64> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || -> Result<u64> {
            let conn = conn.lock();
            let last: i64 = conn
                .query_row("SELECT COALESCE(MAX(sequence), 0) FROM audit_log", [], |row| {
                    row.get(0)
                })
                .context("Failed to read last sequence")?;
            u64::try_from(last).context("Negative audit sequence")
        })
        .await
        .context("Failed to spawn blocking task")?
    }
}
