//! Default change-capture triggers for the embedded database.
//!
//! Every syncable table gets AFTER INSERT/UPDATE/DELETE triggers that
//! append to the outbox. All triggers are guarded by a one-row
//! `sync_suppress` table so the apply pipeline can write remote rows
//! without generating feedback. Hosts with their own capture scheme can
//! ignore this module and implement the trigger hooks themselves.

use rusqlite::Connection;

use crate::error::Result;
use oosync_core::{PrimaryKey, SchemaRegistry};

const SUPPRESS_DDL: &str = "
CREATE TABLE IF NOT EXISTS sync_suppress (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    suppressed INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO sync_suppress (id, suppressed) VALUES (1, 0);
";

/// SQLite expression for the current UTC instant in canonical ISO-8601.
const NOW_EXPR: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

/// Install the suppression flag and per-table capture triggers.
///
/// Idempotent: existing triggers are replaced so schema changes in the
/// registry take effect.
pub fn install_sync_triggers(conn: &Connection, registry: &SchemaRegistry) -> Result<()> {
    conn.execute_batch(SUPPRESS_DDL)?;

    for table in registry.syncable_tables() {
        let schema = match registry.table(table) {
            Some(s) => s,
            None => continue,
        };
        let row_new = row_id_expr(&schema.primary_key, "NEW", registry);
        let row_old = row_id_expr(&schema.primary_key, "OLD", registry);
        let changed_new = changed_at_expr(schema.last_modified_column.as_deref(), "NEW");
        let device_new = device_expr(schema.device_column.as_deref(), "NEW");
        let device_old = device_expr(schema.device_column.as_deref(), "OLD");

        for (suffix, event, op, row_expr, changed, device) in [
            ("ai", "INSERT", "INSERT", &row_new, &changed_new, &device_new),
            ("au", "UPDATE", "UPDATE", &row_new, &changed_new, &device_new),
            ("ad", "DELETE", "DELETE", &row_old, &NOW_EXPR.to_string(), &device_old),
        ] {
            let name = format!("oosync_{suffix}_{table}");
            let ddl = format!(
                "DROP TRIGGER IF EXISTS {name};\n\
                 CREATE TRIGGER {name} AFTER {event} ON {table}\n\
                 WHEN (SELECT suppressed FROM sync_suppress WHERE id = 1) = 0\n\
                 BEGIN\n\
                   INSERT INTO sync_outbox (id, table_name, row_id, op, status, changed_at, attempts, device_id)\n\
                   VALUES (lower(hex(randomblob(16))), '{table}', {row_expr}, '{op}', 'pending', {changed}, 0, {device});\n\
                 END;"
            );
            conn.execute_batch(&ddl)?;
        }
    }
    Ok(())
}

/// Raise the suppression flag: local writes stop enqueueing.
pub fn suppress(conn: &Connection) -> Result<()> {
    conn.execute("UPDATE sync_suppress SET suppressed = 1 WHERE id = 1", [])?;
    Ok(())
}

/// Lower the suppression flag.
pub fn enable(conn: &Connection) -> Result<()> {
    conn.execute("UPDATE sync_suppress SET suppressed = 0 WHERE id = 1", [])?;
    Ok(())
}

fn row_id_expr(pk: &PrimaryKey, row: &str, registry: &SchemaRegistry) -> String {
    match pk {
        PrimaryKey::Single(col) => format!("CAST({row}.{col} AS TEXT)"),
        PrimaryKey::Composite(cols) => {
            let pairs: Vec<String> = cols
                .iter()
                .map(|c| format!("'{}', {row}.{c}", registry.snake_to_camel(c)))
                .collect();
            format!("json_object({})", pairs.join(", "))
        }
    }
}

fn changed_at_expr(last_modified: Option<&str>, row: &str) -> String {
    match last_modified {
        Some(col) => format!("COALESCE({row}.{col}, {NOW_EXPR})"),
        None => NOW_EXPR.to_string(),
    }
}

fn device_expr(device_column: Option<&str>, row: &str) -> String {
    match device_column {
        Some(col) => format!("{row}.{col}"),
        None => "NULL".to_string(),
    }
}
