//! Push application: each incoming change becomes one statement wrapped in
//! its own savepoint, so a bad row never aborts the outer transaction.
//! Statement failures are reported with a structured `table=… row=…`
//! prefix and the Postgres code/constraint/detail folded into one line,
//! never the SQL or the bindings.

use std::collections::BTreeSet;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio_postgres::Transaction;
use tracing::{debug, warn};

use crate::config::{EdgeConfig, TableRules};
use crate::error::Result;
use crate::pg::{params_ref, PgValue};
use oosync_core::{normalize, ChangeRow, SchemaRegistry, TableSchema};

/// Tables the engine itself maintains; never accepted from a client.
const SYNC_INFRA_TABLES: [&str; 3] = ["sync_outbox", "sync_meta", "sync_table_log"];

#[derive(Debug, Default)]
pub struct PushSummary {
    pub applied: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

// ============================================================================
// Entry point
// ============================================================================

pub async fn apply_push(
    tx: &mut Transaction<'_>,
    registry: &SchemaRegistry,
    config: &EdgeConfig,
    changes: &[ChangeRow],
    debug_log: &mut Vec<String>,
) -> Result<PushSummary> {
    let mut summary = PushSummary::default();
    let mut touched: BTreeSet<String> = BTreeSet::new();

    for change in changes {
        if change.table.is_empty() || SYNC_INFRA_TABLES.contains(&change.table.as_str()) {
            warn!(table = %change.table, "ignoring change for sync-infra table");
            summary.skipped += 1;
            continue;
        }
        let schema = match registry.table(&change.table) {
            Some(s) => s,
            None => {
                warn!(table = %change.table, "ignoring change for unknown table");
                summary.skipped += 1;
                continue;
            }
        };
        if schema.last_modified_column.is_none() {
            summary.errors.push(format!(
                "table={} row={}: table has no last-modified column and cannot accept pushes",
                change.table, change.row_id
            ));
            continue;
        }
        let rules = config.rules_for(&change.table);

        let outcome = if change.deleted {
            apply_delete(tx, registry, schema, &rules, change, debug_log).await?
        } else {
            apply_upsert(tx, registry, schema, &rules, change).await?
        };

        match outcome {
            RowOutcome::Applied => {
                summary.applied += 1;
                touched.insert(change.table.clone());
            }
            RowOutcome::Skipped => summary.skipped += 1,
            RowOutcome::Failed(message) => summary.errors.push(message),
        }
    }

    // One change-log row per table, keyed by name; incremental pulls scan
    // it instead of every table.
    for table in &touched {
        tx.execute(
            "INSERT INTO sync_table_log (table_name, changed_at) VALUES ($1, now())
             ON CONFLICT (table_name) DO UPDATE SET changed_at = now()",
            &[table],
        )
        .await?;
    }

    Ok(summary)
}

enum RowOutcome {
    Applied,
    Skipped,
    Failed(String),
}

// ============================================================================
// Upserts
// ============================================================================

async fn apply_upsert(
    tx: &mut Transaction<'_>,
    registry: &SchemaRegistry,
    schema: &TableSchema,
    rules: &TableRules,
    change: &ChangeRow,
) -> Result<RowOutcome> {
    let row = match sanitize_for_push(change, schema, rules, registry) {
        Ok(row) => row,
        Err(message) => {
            return Ok(RowOutcome::Failed(format!(
                "table={} row={}: {message}",
                change.table, change.row_id
            )))
        }
    };

    let (sql, params) = build_upsert(schema, rules, &row);
    match exec_in_savepoint(tx, &sql, &params).await? {
        Ok(_) => Ok(RowOutcome::Applied),
        Err(e) => {
            // A configured keep-list gets one more try with a minimal payload.
            if !rules.retry_keep_props.is_empty() {
                let keep: BTreeSet<String> = rules
                    .retry_keep_props
                    .iter()
                    .map(|p| registry.camel_to_snake(p))
                    .chain(schema.conflict_columns().iter().map(|c| c.to_string()))
                    .chain(schema.primary_key.columns().iter().map(|c| c.to_string()))
                    .collect();
                let minimal: Map<String, Value> = row
                    .iter()
                    .filter(|(k, _)| keep.contains(*k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let (sql, params) = build_upsert(schema, rules, &minimal);
                if let Ok(n) = exec_in_savepoint(tx, &sql, &params).await? {
                    debug!(table = %schema.name, row = %change.row_id, rows = n, "minimal-payload retry succeeded");
                    return Ok(RowOutcome::Applied);
                }
            }
            Ok(RowOutcome::Failed(pg_error_line(
                &change.table,
                &change.row_id,
                &e,
            )))
        }
    }
}

/// `INSERT … ON CONFLICT (…) DO UPDATE SET c = EXCLUDED.c`, honoring the
/// table's omit-set props. The synthetic primary key never enters the SET
/// clause when the conflict target is a natural key.
fn build_upsert(
    schema: &TableSchema,
    rules: &TableRules,
    row: &Map<String, Value>,
) -> (String, Vec<PgValue>) {
    let cols: Vec<&String> = row.keys().collect();
    let params: Vec<PgValue> = cols
        .iter()
        .map(|c| PgValue::from_json(&row[c.as_str()]))
        .collect();

    let conflict = schema.conflict_columns();
    let pk_cols = schema.primary_key.columns();
    let natural_target = conflict != pk_cols;

    let mut omit: BTreeSet<&str> = conflict.iter().copied().collect();
    if natural_target {
        omit.extend(pk_cols.iter().copied());
    }
    let omit_props: Vec<String> = rules.omit_set_props.clone();
    omit.extend(omit_props.iter().map(|s| s.as_str()));

    let col_list = cols
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=cols.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let set_list = cols
        .iter()
        .filter(|c| !omit.contains(c.as_str()))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let target = conflict.join(", ");

    let sql = if set_list.is_empty() {
        format!(
            "INSERT INTO {} ({col_list}) VALUES ({placeholders}) ON CONFLICT ({target}) DO NOTHING",
            schema.name
        )
    } else {
        format!(
            "INSERT INTO {} ({col_list}) VALUES ({placeholders}) ON CONFLICT ({target}) DO UPDATE SET {set_list}",
            schema.name
        )
    };
    (sql, params)
}

// ============================================================================
// Deletes
// ============================================================================

async fn apply_delete(
    tx: &mut Transaction<'_>,
    registry: &SchemaRegistry,
    schema: &TableSchema,
    rules: &TableRules,
    change: &ChangeRow,
    debug_log: &mut Vec<String>,
) -> Result<RowOutcome> {
    if rules.deny_delete {
        // Append-only table: the delete is acknowledged but not applied.
        warn!(table = %schema.name, row = %change.row_id, "delete refused for append-only table");
        debug_log.push(format!("deny-delete: {} {}", schema.name, change.row_id));
        return Ok(RowOutcome::Skipped);
    }

    // Prefer the full primary key; fall back to the natural key.
    let (predicate_cols, values) = match delete_key(registry, schema, change) {
        Some(found) => found,
        None => {
            warn!(table = %schema.name, row = %change.row_id, "delete payload has no usable key; skipping");
            return Ok(RowOutcome::Skipped);
        }
    };

    let predicate = predicate_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c} = ${}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");

    let (sql, params) = if schema.soft_delete {
        let lmc = schema
            .last_modified_column
            .as_deref()
            .unwrap_or("last_modified_at");
        let stamp = change
            .last_modified_at
            .clone()
            .map(|t| normalize::normalize_timestamp(&t))
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let n = predicate_cols.len() + 1;
        let mut params = values;
        params.push(PgValue::Text(stamp));
        (
            format!(
                "UPDATE {} SET deleted = TRUE, {lmc} = ${n} WHERE {predicate}",
                schema.name
            ),
            params,
        )
    } else {
        (
            format!("DELETE FROM {} WHERE {predicate}", schema.name),
            values,
        )
    };

    match exec_in_savepoint(tx, &sql, &params).await? {
        Ok(_) => Ok(RowOutcome::Applied),
        Err(e) => Ok(RowOutcome::Failed(pg_error_line(
            &change.table,
            &change.row_id,
            &e,
        ))),
    }
}

/// Columns and values identifying the row to delete: the primary key when
/// every component is present, else the conflict key, else nothing.
fn delete_key(
    registry: &SchemaRegistry,
    schema: &TableSchema,
    change: &ChangeRow,
) -> Option<(Vec<String>, Vec<PgValue>)> {
    let payload = change.data.as_object().cloned().unwrap_or_default();
    let parsed = oosync_core::protocol::parse_row_id(&change.row_id);

    let lookup = |col: &str| -> Option<Value> {
        let camel = registry.snake_to_camel(col);
        payload
            .get(&camel)
            .or_else(|| payload.get(col))
            .or_else(|| parsed.get(&camel))
            .or_else(|| parsed.get(col))
            .cloned()
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
    };

    for candidate in [schema.primary_key.columns(), schema.conflict_columns()] {
        let values: Vec<Option<Value>> = candidate.iter().map(|c| lookup(c)).collect();
        if values.iter().all(|v| v.is_some()) {
            let cols = candidate.iter().map(|c| c.to_string()).collect();
            let params = values
                .into_iter()
                .map(|v| PgValue::from_json(&v.unwrap_or(Value::Null)))
                .collect();
            return Some((cols, params));
        }
    }

    // A bare single-column key travels as the row id itself.
    if !schema.primary_key.is_composite() && !change.row_id.is_empty() {
        let col = schema.primary_key.columns()[0].to_string();
        return Some((vec![col], vec![PgValue::Text(change.row_id.clone())]));
    }
    None
}

// ============================================================================
// Sanitization
// ============================================================================

/// Shape an incoming payload for the authoritative side: snake_case keys,
/// real booleans, canonical timestamps, a guaranteed last-modified value,
/// numeric coercion, and blank-to-null per the table's configured rules.
pub fn sanitize_for_push(
    change: &ChangeRow,
    schema: &TableSchema,
    rules: &TableRules,
    registry: &SchemaRegistry,
) -> std::result::Result<Map<String, Value>, String> {
    let data = change
        .data
        .as_object()
        .ok_or_else(|| "change data is not an object".to_string())?;

    let mut row: Map<String, Value> = data
        .iter()
        .map(|(k, v)| (registry.camel_to_snake(k), v.clone()))
        .collect();

    normalize::sanitize_booleans_to_bool(&mut row, &schema.boolean_columns, registry);
    normalize::normalize_timestamp_props(&mut row, &schema.timestamp_columns, registry);

    // Sync metadata must be present even when the host forgot to stamp it.
    if let Some(lmc) = &schema.last_modified_column {
        let stamp = match row.get(lmc).and_then(|v| v.as_str()) {
            Some(existing) => normalize::normalize_timestamp(existing),
            None => change
                .last_modified_at
                .as_deref()
                .map(normalize::normalize_timestamp)
                .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        };
        row.insert(lmc.clone(), Value::String(stamp));
    }

    for prop in &rules.sanitize.numeric_props {
        let col = registry.camel_to_snake(prop);
        if let Some(Value::String(s)) = row.get(&col) {
            if let Ok(n) = s.parse::<f64>() {
                let replacement = if n.fract() == 0.0 && s.parse::<i64>().is_ok() {
                    Value::from(n as i64)
                } else {
                    Value::from(n)
                };
                row.insert(col, replacement);
            }
        }
    }

    for prop in &rules.sanitize.blank_to_null_props {
        let col = registry.camel_to_snake(prop);
        if row.get(&col).and_then(|v| v.as_str()) == Some("") {
            row.insert(col, Value::Null);
        }
    }

    Ok(row)
}

// ============================================================================
// Statement execution
// ============================================================================

/// Run one statement inside its own savepoint. The outer error is a
/// connection-level failure; the inner is the statement's own.
async fn exec_in_savepoint(
    tx: &mut Transaction<'_>,
    sql: &str,
    params: &[PgValue],
) -> Result<std::result::Result<u64, tokio_postgres::Error>> {
    let sp = tx.savepoint("oosync_row").await?;
    match sp.execute(sql, &params_ref(params)).await {
        Ok(n) => {
            sp.commit().await?;
            Ok(Ok(n))
        }
        Err(e) => {
            // Dropping the savepoint rolls it back; do it explicitly so a
            // rollback failure is visible.
            if let Err(re) = sp.rollback().await {
                warn!(error = %re, "savepoint rollback failed");
            }
            Ok(Err(e))
        }
    }
}

/// One-line, binding-free failure description for the client.
fn pg_error_line(table: &str, row_id: &str, e: &tokio_postgres::Error) -> String {
    let mut line = format!("table={table} rowId={row_id}:");
    if let Some(db) = e.as_db_error() {
        line.push_str(&format!(" code={}", db.code().code()));
        if let Some(constraint) = db.constraint() {
            line.push_str(&format!(" constraint={constraint}"));
        }
        line.push_str(&format!(" {}", db.message()));
        if let Some(detail) = db.detail() {
            line.push_str(&format!(" detail={detail}"));
        }
        if let Some(hint) = db.hint() {
            line.push_str(&format!(" hint={hint}"));
        }
    } else {
        line.push_str(&format!(" {e}"));
    }
    line.replace('\n', " ")
}

// ============================================================================
// Tests
// ============================================================================
