//! `SQLite` state store.
//!
//! Rows carry their record as JSON next to the columns used for lookups.
//! The policy head swap runs in one `BEGIN IMMEDIATE` transaction: the
//! revision check, the pointer move and both status updates commit
//! together or not at all.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use super::{HeadSwap, PolicyHead, StateStore};
use crate::engine::{Ticket, WorkflowInstance};
use crate::policy::{PolicyDefinition, PolicyStatus, Version};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS policy_versions (
    policy_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    definition TEXT NOT NULL,
    PRIMARY KEY (policy_id, version)
);
CREATE TABLE IF NOT EXISTS policy_heads (
    policy_id TEXT PRIMARY KEY,
    current_version INTEGER NOT NULL,
    revision INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS workflow_instances (
    instance_id TEXT PRIMARY KEY,
    policy_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    state TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_instances_status
    ON workflow_instances(status);
CREATE TABLE IF NOT EXISTS tickets (
    ticket_id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    status TEXT NOT NULL,
    ticket TEXT NOT NULL
);
";

/// SQLite-backed [`StateStore`].
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteStateStore {
    /// Open (or create) a state database at `path`.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let db_path = path.into();
        let open_path = db_path.clone();

        let conn = task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&open_path).with_context(|| {
                format!("Failed to open state database at {}", open_path.display())
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("Failed to enable WAL mode")?;
            conn.execute_batch(SCHEMA)
                .context("Failed to create state tables")?;
            Ok(conn)
        })
        .await
        .context("Failed to spawn blocking task")??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .context("Failed to spawn blocking task")?
    }
}

fn load_definition(
    conn: &Connection,
    policy_id: &str,
    version: Version,
) -> Result<Option<PolicyDefinition>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT definition FROM policy_versions WHERE policy_id = ?1 AND version = ?2",
            params![policy_id, i64::from(version)],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to read policy version")?;
    raw.map(|json| serde_json::from_str(&json).context("Invalid stored policy definition"))
        .transpose()
}

fn store_definition(conn: &Connection, definition: &PolicyDefinition) -> Result<()> {
    let json = serde_json::to_string(definition).context("Failed to serialize policy")?;
    conn.execute(
        "UPDATE policy_versions SET status = ?3, definition = ?4 WHERE policy_id = ?1 AND version = ?2",
        params![
            definition.policy_id,
            i64::from(definition.version),
            definition.status.as_str(),
            json
        ],
    )
    .context("Failed to update policy version")?;
    Ok(())
}

fn read_head(conn: &Connection, policy_id: &str) -> Result<Option<PolicyHead>> {
    let row: Option<(i64, i64, String)> = conn
        .query_row(
            "SELECT current_version, revision, updated_at FROM policy_heads WHERE policy_id = ?1",
            params![policy_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("Failed to read policy head")?;

    row.map(|(version, revision, updated_at)| {
        Ok(PolicyHead {
            policy_id: policy_id.to_string(),
            current_version: u32::try_from(version).context("Invalid head version")?,
            revision: u64::try_from(revision).context("Invalid head revision")?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .context("Invalid head timestamp")?
                .with_timezone(&Utc),
        })
    })
    .transpose()
}

/// Apply a head swap inside an open transaction.
fn apply_swap(conn: &Connection, swap: &HeadSwap) -> Result<Option<PolicyHead>> {
    let actual = read_head(conn, &swap.policy_id)?.map_or(0, |h| h.revision);
    if actual != swap.expected_revision {
        return Ok(None);
    }

    let mut target = load_definition(conn, &swap.policy_id, swap.new_version)?.ok_or_else(|| {
        anyhow::anyhow!(
            "Version {} of policy {} is not stored",
            swap.new_version,
            swap.policy_id
        )
    })?;
    target.status = PolicyStatus::Active;
    target.activated_at = Some(swap.at);
    store_definition(conn, &target)?;

    if let Some(previous) = swap.previous {
        if let Some(mut definition) = load_definition(conn, &swap.policy_id, previous)? {
            definition.status = swap.previous_status;
            store_definition(conn, &definition)?;
        }
    }

    let revision = actual + 1;
    conn.execute(
        r"
        INSERT INTO policy_heads (policy_id, current_version, revision, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(policy_id) DO UPDATE SET
            current_version = excluded.current_version,
            revision = excluded.revision,
            updated_at = excluded.updated_at
        ",
        params![
            swap.policy_id,
            i64::from(swap.new_version),
            i64::try_from(revision).context("Revision overflow")?,
            swap.at.to_rfc3339(),
        ],
    )
    .context("Failed to write policy head")?;

    Ok(Some(PolicyHead {
        policy_id: swap.policy_id.clone(),
        current_version: swap.new_version,
        revision,
        updated_at: swap.at,
    }))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn insert_policy_version(&self, definition: &PolicyDefinition) -> Result<bool> {
        let json = serde_json::to_string(definition).context("Failed to serialize policy")?;
        let policy_id = definition.policy_id.clone();
        let version = i64::from(definition.version);
        let status = definition.status.as_str();

        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    r"
                    INSERT OR IGNORE INTO policy_versions (policy_id, version, status, definition)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                    params![policy_id, version, status, json],
                )
                .context("Failed to insert policy version")?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn policy_version(
        &self,
        policy_id: &str,
        version: Version,
    ) -> Result<Option<PolicyDefinition>> {
        let policy_id = policy_id.to_string();
        self.with_conn(move |conn| load_definition(conn, &policy_id, version))
            .await
    }

    async fn policy_versions(&self, policy_id: &str) -> Result<Vec<PolicyDefinition>> {
        let policy_id = policy_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT definition FROM policy_versions WHERE policy_id = ?1 ORDER BY version ASC",
            )?;
            let rows = stmt.query_map(params![policy_id], |row| row.get::<_, String>(0))?;
            let mut definitions = Vec::new();
            for row in rows {
                let json = row.context("Failed to read policy row")?;
                definitions.push(
                    serde_json::from_str(&json).context("Invalid stored policy definition")?,
                );
            }
            Ok(definitions)
        })
        .await
    }

    async fn latest_version(&self, policy_id: &str) -> Result<Option<Version>> {
        let policy_id = policy_id.to_string();
        self.with_conn(move |conn| {
            let latest: Option<i64> = conn
                .query_row(
                    "SELECT MAX(version) FROM policy_versions WHERE policy_id = ?1",
                    params![policy_id],
                    |row| row.get(0),
                )
                .context("Failed to read latest version")?;
            latest
                .map(|v| u32::try_from(v).context("Invalid stored version"))
                .transpose()
        })
        .await
    }

    async fn policy_head(&self, policy_id: &str) -> Result<Option<PolicyHead>> {
        let policy_id = policy_id.to_string();
        self.with_conn(move |conn| read_head(conn, &policy_id)).await
    }

    async fn swap_head(&self, swap: HeadSwap) -> Result<Option<PolicyHead>> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .context("Failed to begin transaction")?;
            let head = apply_swap(&tx, &swap)?;
            if head.is_some() {
                tx.commit().context("Failed to commit head swap")?;
            }
            Ok(head)
        })
        .await
    }

    async fn list_policy_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT DISTINCT policy_id FROM policy_versions ORDER BY policy_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to list policies")?;
            Ok(ids)
        })
        .await
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let json = serde_json::to_string(instance).context("Failed to serialize instance")?;
        let instance_id = instance.instance_id.clone();
        let policy_id = instance.policy_id.clone();
        let status = instance.status.as_str();
        let created_at = instance.created_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                r"
                INSERT INTO workflow_instances (instance_id, policy_id, status, created_at, state)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(instance_id) DO UPDATE SET
                    status = excluded.status,
                    state = excluded.state
                ",
                params![instance_id, policy_id, status, created_at, json],
            )
            .context("Failed to save instance")?;
            Ok(())
        })
        .await
    }

    async fn load_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        let instance_id = instance_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT state FROM workflow_instances WHERE instance_id = ?1",
                    params![instance_id],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to load instance")?;
            raw.map(|json| serde_json::from_str(&json).context("Invalid stored instance"))
                .transpose()
        })
        .await
    }

    async fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                r"
                SELECT state FROM workflow_instances
                WHERE status IN ('RUNNING', 'PAUSED')
                ORDER BY created_at ASC
                ",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut instances = Vec::new();
            for row in rows {
                let json = row.context("Failed to read instance row")?;
                instances.push(serde_json::from_str(&json).context("Invalid stored instance")?);
            }
            Ok(instances)
        })
        .await
    }

    async fn save_ticket(&self, ticket: &Ticket) -> Result<()> {
        let json = serde_json::to_string(ticket).context("Failed to serialize ticket")?;
        let ticket_id = ticket.ticket_id.clone();
        let instance_id = ticket.instance_id.clone();
        let status = ticket.status.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                r"
                INSERT INTO tickets (ticket_id, instance_id, status, ticket)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(ticket_id) DO UPDATE SET
                    status = excluded.status,
                    ticket = excluded.ticket
                ",
                params![ticket_id, instance_id, status, json],
            )
            .context("Failed to save ticket")?;
            Ok(())
        })
        .await
    }

    async fn load_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>> {
        let ticket_id = ticket_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT ticket FROM tickets WHERE ticket_id = ?1",
                    params![ticket_id],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to load ticket")?;
            raw.map(|json| serde_json::from_str(&json).context("Invalid stored ticket"))
                .transpose()
        })
        .await
    }
}
