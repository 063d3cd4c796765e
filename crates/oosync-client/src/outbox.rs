//! Push queue (outbox): a durable local table written by the capture
//! triggers and drained by the engine. Completion deletes rows, failures
//! keep them with an incremented attempts counter, and a backfill scan
//! recovers writes that happened while triggers were suppressed.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use oosync_core::{Op, PrimaryKey, SchemaRegistry};

const OUTBOX_DDL: &str = "
CREATE TABLE IF NOT EXISTS sync_outbox (
    id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    op TEXT NOT NULL CHECK (op IN ('INSERT','UPDATE','DELETE')),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','in_progress','completed','failed')),
    changed_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    synced_at TEXT,
    device_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_sync_outbox_status_changed
    ON sync_outbox (status, changed_at);
";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InProgress => "in_progress",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> OutboxStatus {
        match s {
            "in_progress" => OutboxStatus::InProgress,
            "completed" => OutboxStatus::Completed,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxItem {
    pub id: String,
    pub table: String,
    /// Primary-key string, or JSON-encoded object of the composite key.
    pub row_id: String,
    pub op: Op,
    pub status: OutboxStatus,
    pub changed_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub synced_at: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub total: i64,
}

pub use oosync_core::protocol::parse_row_id;

// ============================================================================
// Outbox
// ============================================================================

/// Borrowing wrapper over the local connection's outbox table.
pub struct Outbox<'c> {
    conn: &'c Connection,
}

impl<'c> Outbox<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn ensure_table(conn: &Connection) -> Result<()> {
        conn.execute_batch(OUTBOX_DDL)?;
        Ok(())
    }

    /// Engine-side enqueue, used by the backfill scan and backup replay.
    /// Triggers insert directly with the same statement.
    pub fn enqueue(
        &self,
        table: &str,
        row_id: &str,
        op: Op,
        changed_at: &str,
        device_id: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO sync_outbox (id, table_name, row_id, op, status, changed_at, attempts, device_id)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6)",
            params![id, table, row_id, op.as_str(), changed_at, device_id],
        )?;
        Ok(id)
    }

    /// Pending items, oldest change first.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<OutboxItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, table_name, row_id, op, status, changed_at, attempts, last_error, synced_at, device_id
             FROM sync_outbox WHERE status = 'pending'
             ORDER BY changed_at ASC, id ASC LIMIT ?1",
        )?;
        let items = stmt
            .query_map(params![limit as i64], item_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn mark_in_progress(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_outbox SET status = 'in_progress' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Completion deletes the row, keeping the queue minimal.
    pub fn mark_completed(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Transient failure: back to pending with an incremented attempts
    /// counter so the next drain retries it.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_outbox
             SET status = 'pending', attempts = attempts + 1, last_error = ?2
             WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    pub fn mark_permanently_failed(&self, id: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_outbox
             SET status = 'failed', attempts = attempts + 1, last_error = ?2
             WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    pub fn retry(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_outbox SET status = 'pending', last_error = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// COUNT aggregates only; never loads rows.
    pub fn stats(&self) -> Result<OutboxStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM sync_outbox GROUP BY status")?;
        let mut stats = OutboxStats::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            match OutboxStatus::parse(&status) {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::InProgress => stats.in_progress = count,
                OutboxStatus::Failed => stats.failed = count,
                OutboxStatus::Completed => {}
            }
        }
        Ok(stats)
    }

    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute("DELETE FROM sync_outbox", [])?;
        Ok(())
    }

    /// Drop completed/failed items whose change is older than `max_age_ms`.
    pub fn clear_older_than(&self, max_age_ms: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::milliseconds(max_age_ms))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let removed = self.conn.execute(
            "DELETE FROM sync_outbox
             WHERE status IN ('completed','failed') AND changed_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Backfill
    // -----------------------------------------------------------------------

    /// Re-enqueue rows modified at or after `after_iso` that have no
    /// pending entry. Run after a trigger-suppression window to recover
    /// local writes that bypassed the triggers. Only tables supporting
    /// incremental sync can be scanned; `device_id` (when the table
    /// records one) keeps applied-remote rows out of the scan.
    pub fn backfill_since(
        &self,
        registry: &SchemaRegistry,
        after_iso: &str,
        table_allowlist: Option<&[String]>,
        device_id: Option<&str>,
    ) -> Result<usize> {
        let mut enqueued = 0;
        for table in registry.syncable_tables() {
            if let Some(allow) = table_allowlist {
                if !allow.iter().any(|t| t == table) {
                    continue;
                }
            }
            let schema = match registry.table(table) {
                Some(s) => s,
                None => continue,
            };
            let lmc = match &schema.last_modified_column {
                Some(c) => c,
                None => continue,
            };

            let pk_cols = schema.primary_key.columns();
            let select_cols = pk_cols.join(", ");
            let mut sql = format!(
                "SELECT {select_cols}, {lmc} FROM {table} WHERE {lmc} >= ?1"
            );
            if let (Some(device_col), Some(_)) = (&schema.device_column, device_id) {
                sql.push_str(&format!(" AND {device_col} = ?2"));
            }

            let mut stmt = self.conn.prepare(&sql)?;
            let map_row = |row: &Row<'_>| -> rusqlite::Result<(String, String)> {
                let row_id = row_id_from_pk(row, &schema.primary_key, registry)?;
                let changed_at: String = row.get(pk_cols.len())?;
                Ok((row_id, changed_at))
            };
            let rows: Vec<(String, String)> =
                if schema.device_column.is_some() && device_id.is_some() {
                    stmt.query_map(params![after_iso, device_id], map_row)?
                        .collect::<std::result::Result<_, _>>()?
                } else {
                    stmt.query_map(params![after_iso], map_row)?
                        .collect::<std::result::Result<_, _>>()?
                };

            let open = self.open_row_ids(table)?;
            for (row_id, changed_at) in rows {
                if open.contains(&row_id) {
                    continue;
                }
                self.enqueue(table, &row_id, Op::Update, &changed_at, device_id)?;
                enqueued += 1;
                debug!(table = %table, row_id = %row_id, "backfilled outbox entry after suppression window");
            }
        }
        if enqueued > 0 {
            warn!(enqueued, "recovered local writes made during trigger suppression");
        }
        Ok(enqueued)
    }

    /// Row ids with a pending or in-progress entry for the table.
    fn open_row_ids(&self, table: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_id FROM sync_outbox
             WHERE table_name = ?1 AND status IN ('pending','in_progress')",
        )?;
        let ids = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Latest change timestamp for a pending entry, if any. Used by tests
    /// and diagnostics.
    pub fn newest_pending_changed_at(&self) -> Result<Option<String>> {
        let newest = self
            .conn
            .query_row(
                "SELECT MAX(changed_at) FROM sync_outbox WHERE status = 'pending'",
                [],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(newest)
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxItem> {
    let op: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(OutboxItem {
        id: row.get(0)?,
        table: row.get(1)?,
        row_id: row.get(2)?,
        op: Op::parse(&op).unwrap_or(Op::Update),
        status: OutboxStatus::parse(&status),
        changed_at: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        synced_at: row.get(8)?,
        device_id: row.get(9)?,
    })
}

/// Build the canonical row id from a result row's leading pk columns.
fn row_id_from_pk(
    row: &Row<'_>,
    pk: &PrimaryKey,
    registry: &SchemaRegistry,
) -> rusqlite::Result<String> {
    match pk {
        PrimaryKey::Single(_) => {
            let v: rusqlite::types::Value = row.get(0)?;
            Ok(sql_value_to_string(v))
        }
        PrimaryKey::Composite(cols) => {
            let mut map = Map::new();
            for (i, col) in cols.iter().enumerate() {
                let v: rusqlite::types::Value = row.get(i)?;
                map.insert(registry.snake_to_camel(col), sql_value_to_json(v));
            }
            Ok(Value::Object(map).to_string())
        }
    }
}

fn sql_value_to_string(v: rusqlite::types::Value) -> String {
    match v {
        rusqlite::types::Value::Text(s) => s,
        rusqlite::types::Value::Integer(i) => i.to_string(),
        rusqlite::types::Value::Real(f) => f.to_string(),
        rusqlite::types::Value::Null => String::new(),
        rusqlite::types::Value::Blob(_) => String::new(),
    }
}

fn sql_value_to_json(v: rusqlite::types::Value) -> Value {
    match v {
        rusqlite::types::Value::Text(s) => Value::String(s),
        rusqlite::types::Value::Integer(i) => Value::from(i),
        rusqlite::types::Value::Real(f) => Value::from(f),
        _ => Value::Null,
    }
}

// ============================================================================
// Tests
// ============================================================================
