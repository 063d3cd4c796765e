//! Apply-remote pipeline: merge a page of remote changes into the local
//! database. Changes are sorted so parents land before children, applied
//! under trigger suppression, and foreign-key failures are deferred for a
//! bounded retry instead of failing the page. After the window closes a
//! backfill scan re-enqueues any local writes the suppressed triggers
//! missed.

use std::collections::BTreeSet;

use chrono::{SecondsFormat, Utc};
use rusqlite::{ffi, Connection, ErrorCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::host::HostHooks;
use crate::outbox::{parse_row_id, Outbox};
use oosync_core::{normalize, ChangeRow, SchemaRegistry, TableSchema};

/// Maximum deferred-FK retry passes. Three passes resolve any acyclic
/// ordering problem that fits in one batch; a genuine cycle will not
/// converge and is reported as a failure.
const MAX_DEFERRED_PASSES: usize = 3;

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub failed: usize,
    /// Rows skipped as no-ops (unknown table, missing key in a delete).
    pub skipped: usize,
    pub errors: Vec<String>,
    pub affected_tables: Vec<String>,
    /// Foreign-key failures awaiting a retry pass.
    pub deferred: Vec<ChangeRow>,
}

impl ApplyOutcome {
    fn absorb(&mut self, other: ApplyOutcome) {
        self.applied += other.applied;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
        for table in other.affected_tables {
            if !self.affected_tables.contains(&table) {
                self.affected_tables.push(table);
            }
        }
        self.deferred = other.deferred;
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Apply one page of remote changes, then run the deferred-FK retry loop.
/// Surviving deferred rows are converted into failures.
pub fn apply_with_deferred_retries(
    conn: &Connection,
    registry: &SchemaRegistry,
    hooks: &dyn HostHooks,
    changes: &[ChangeRow],
    device_id: &str,
) -> Result<ApplyOutcome> {
    let mut outcome = apply_remote_changes(conn, registry, hooks, changes, device_id)?;
    retry_deferred(conn, registry, hooks, &mut outcome, device_id)?;
    Ok(outcome)
}

/// Run the deferred-FK retry loop on an outcome accumulated across pages.
/// Idempotent on an already-drained deferred list.
pub fn retry_deferred(
    conn: &Connection,
    registry: &SchemaRegistry,
    hooks: &dyn HostHooks,
    outcome: &mut ApplyOutcome,
    device_id: &str,
) -> Result<()> {
    for _pass in 0..MAX_DEFERRED_PASSES {
        if outcome.deferred.is_empty() {
            break;
        }
        let deferred = std::mem::take(&mut outcome.deferred);
        let before = deferred.len();
        let retry = apply_remote_changes(conn, registry, hooks, &deferred, device_id)?;
        let after = retry.deferred.len();
        outcome.absorb(retry);
        if after == before {
            // No progress; further passes cannot help.
            break;
        }
    }

    if !outcome.deferred.is_empty() {
        outcome.failed += outcome.deferred.len();
        for change in outcome.deferred.drain(..) {
            outcome.errors.push(format!(
                "table={} row={}: foreign key unresolved after {MAX_DEFERRED_PASSES} passes",
                change.table, change.row_id
            ));
        }
    }
    Ok(())
}

/// Apply a page of remote changes without the retry loop. The returned
/// outcome's `deferred` list belongs to the caller.
pub fn apply_remote_changes(
    conn: &Connection,
    registry: &SchemaRegistry,
    hooks: &dyn HostHooks,
    changes: &[ChangeRow],
    device_id: &str,
) -> Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    if changes.is_empty() {
        return Ok(outcome);
    }

    let ordered = sort_by_dependency(changes, registry);

    hooks.suppress_sync_triggers(conn)?;
    let suppressed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let mut affected = BTreeSet::new();
    for change in ordered {
        let schema = match registry.table(&change.table) {
            Some(s) => s,
            None => {
                warn!(table = %change.table, "skipping change for unknown table");
                outcome.skipped += 1;
                continue;
            }
        };

        let result = if change.deleted {
            delete_row(conn, registry, schema, change)
        } else {
            upsert_row(conn, registry, schema, change)
        };

        match result {
            Ok(RowOutcome::Applied) => {
                outcome.applied += 1;
                affected.insert(change.table.clone());
            }
            Ok(RowOutcome::Skipped) => outcome.skipped += 1,
            Err(RowError::ForeignKey) => outcome.deferred.push(change.clone()),
            Err(RowError::Other(message)) => {
                outcome.failed += 1;
                outcome
                    .errors
                    .push(format!("table={} row={}: {message}", change.table, change.row_id));
            }
        }
    }
    outcome.affected_tables = affected.into_iter().collect();

    // Triggers come back on no matter what happened above.
    if let Err(e) = hooks.enable_sync_triggers(conn) {
        warn!(error = %e, "failed to restore sync triggers");
    }

    // Recover user writes that raced the suppression window. Never fails
    // the batch.
    let backfill = Outbox::new(conn).backfill_since(
        registry,
        &suppressed_at,
        Some(&outcome.affected_tables),
        Some(device_id),
    );
    if let Err(e) = backfill {
        warn!(error = %e, "backfill after trigger suppression failed");
    }

    debug!(
        applied = outcome.applied,
        failed = outcome.failed,
        deferred = outcome.deferred.len(),
        "applied remote page"
    );
    Ok(outcome)
}

// ============================================================================
// Ordering
// ============================================================================

/// Non-deletes before deletes; non-deletes parents-first (rank ascending),
/// deletes children-first (rank descending).
fn sort_by_dependency<'a>(
    changes: &'a [ChangeRow],
    registry: &SchemaRegistry,
) -> Vec<&'a ChangeRow> {
    let mut upserts: Vec<&ChangeRow> = changes.iter().filter(|c| !c.deleted).collect();
    let mut deletes: Vec<&ChangeRow> = changes.iter().filter(|c| c.deleted).collect();
    upserts.sort_by_key(|c| registry.rank(&c.table));
    deletes.sort_by_key(|c| std::cmp::Reverse(registry.rank(&c.table)));
    upserts.extend(deletes);
    upserts
}

// ============================================================================
// Row application
// ============================================================================

enum RowOutcome {
    Applied,
    Skipped,
}

enum RowError {
    ForeignKey,
    Other(String),
}

fn classify(e: rusqlite::Error) -> RowError {
    if let rusqlite::Error::SqliteFailure(inner, ref message) = e {
        if inner.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return RowError::ForeignKey;
        }
        if inner.code == ErrorCode::ConstraintViolation {
            return RowError::Other(
                message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            );
        }
    }
    RowError::Other(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn delete_row(
    conn: &Connection,
    registry: &SchemaRegistry,
    schema: &TableSchema,
    change: &ChangeRow,
) -> std::result::Result<RowOutcome, RowError> {
    let key = key_values(registry, schema, change);
    let pk_cols = schema.primary_key.columns();
    let mut values = Vec::with_capacity(pk_cols.len());
    for col in &pk_cols {
        match key.get(*col) {
            Some(v) if !v.is_null() && v.as_str() != Some("") => values.push(json_to_sql(v)),
            _ => {
                warn!(table = %schema.name, row = %change.row_id, column = %col,
                      "delete payload is missing a primary-key value; skipping");
                return Ok(RowOutcome::Skipped);
            }
        }
    }

    let predicate = pk_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!("DELETE FROM {} WHERE {predicate}", schema.name);
    conn.execute(&sql, rusqlite::params_from_iter(values))
        .map_err(classify)?;
    Ok(RowOutcome::Applied)
}

fn upsert_row(
    conn: &Connection,
    registry: &SchemaRegistry,
    schema: &TableSchema,
    change: &ChangeRow,
) -> std::result::Result<RowOutcome, RowError> {
    let Some(data) = change.data.as_object() else {
        return Err(RowError::Other("change data is not an object".to_string()));
    };

    // Wire properties are camelCase; local columns are snake_case.
    let mut row: Map<String, Value> = data
        .iter()
        .map(|(k, v)| (registry.camel_to_snake(k), v.clone()))
        .collect();
    normalize::sanitize_booleans_to_int(&mut row, &schema.boolean_columns, registry);
    normalize::normalize_timestamp_props(&mut row, &schema.timestamp_columns, registry);

    let cols: Vec<String> = row.keys().cloned().collect();
    if cols.is_empty() {
        return Ok(RowOutcome::Skipped);
    }
    let values: Vec<rusqlite::types::Value> = cols.iter().map(|c| json_to_sql(&row[c])).collect();

    let pk_cols: Vec<&str> = schema.primary_key.columns();
    let sql = upsert_sql(&schema.name, &cols, &pk_cols, &pk_cols);
    match conn.execute(&sql, rusqlite::params_from_iter(values.iter())) {
        Ok(_) => return Ok(RowOutcome::Applied),
        Err(e) => {
            let conflict_cols = schema.conflict_columns();
            let has_natural_key = conflict_cols != pk_cols;
            if !(is_unique_violation(&e) && has_natural_key) {
                return Err(classify(e));
            }
            // Reconcile on the natural key. The synthetic primary key of
            // the existing row is preserved unless this table adopts the
            // server identity.
            let mut omit: Vec<&str> = conflict_cols.clone();
            if !schema.adopt_server_id {
                omit.extend(pk_cols.iter().copied());
            }
            let sql = upsert_sql(&schema.name, &cols, &conflict_cols, &omit);
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))
                .map_err(classify)?;
            Ok(RowOutcome::Applied)
        }
    }
}

/// `INSERT … ON CONFLICT(target) DO UPDATE SET c = excluded.c` with the
/// `omit` columns excluded from the update set.
fn upsert_sql(table: &str, cols: &[String], conflict: &[&str], omit: &[&str]) -> String {
    let col_list = cols.join(", ");
    let placeholders = (1..=cols.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let set_list = cols
        .iter()
        .filter(|c| !omit.iter().any(|o| o == &c.as_str()))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let target = conflict.join(", ");
    if set_list.is_empty() {
        format!("INSERT INTO {table} ({col_list}) VALUES ({placeholders}) ON CONFLICT({target}) DO NOTHING")
    } else {
        format!(
            "INSERT INTO {table} ({col_list}) VALUES ({placeholders}) ON CONFLICT({target}) DO UPDATE SET {set_list}"
        )
    }
}

/// Key columns for a delete: payload values take precedence, the row id
/// fills the gaps.
fn key_values(
    registry: &SchemaRegistry,
    schema: &TableSchema,
    change: &ChangeRow,
) -> Map<String, Value> {
    let mut out = Map::new();
    let parsed = parse_row_id(&change.row_id);
    for col in schema.primary_key.columns() {
        let camel = registry.snake_to_camel(col);
        let from_data = change
            .data
            .as_object()
            .and_then(|d| d.get(&camel).or_else(|| d.get(col)))
            .cloned();
        let v = from_data.or_else(|| parsed.get(&camel).or_else(|| parsed.get(col)).cloned());
        if let Some(v) = v {
            out.insert(col.to_string(), v);
        }
    }
    // Single synthetic keys also travel as the bare row id.
    if out.is_empty() && !schema.primary_key.is_composite() {
        if let Some(col) = schema.primary_key.columns().first() {
            out.insert(col.to_string(), Value::String(change.row_id.clone()));
        }
    }
    out
}

fn json_to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================
