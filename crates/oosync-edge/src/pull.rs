//! Pull computation: incremental scans driven by the table-level change
//! log, and cursor-paginated initial scans frozen to a snapshot watermark.
//! Rows leave here normalized for the embedded side: camelCase keys,
//! ISO-8601 timestamps with an explicit zone, booleans as 0/1.

use std::collections::{HashMap, HashSet};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio_postgres::types::Type;
use tokio_postgres::{Row, Transaction};
use tracing::{debug, warn};

use crate::config::EdgeConfig;
use crate::error::Result;
use crate::pg::{params_ref, PgValue};
use crate::rules::{self, Compiled};
use oosync_core::{
    clamp_page_size, normalize, ChangeRow, PullCursor, PullRule, SchemaRegistry, SyncRequest,
    TableSchema,
};

pub struct PullOutcome {
    pub changes: Vec<ChangeRow>,
    pub next_cursor: Option<String>,
    pub sync_started_at: Option<String>,
    pub synced_at: String,
}

// ============================================================================
// Entry point
// ============================================================================

pub async fn compute_pull(
    tx: &Transaction<'_>,
    registry: &SchemaRegistry,
    config: &EdgeConfig,
    user_id: &str,
    collections: &HashMap<String, Vec<String>>,
    request: &SyncRequest,
    debug_log: &mut Vec<String>,
) -> Result<PullOutcome> {
    let synced_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    match &request.last_sync_at {
        Some(last_sync_at) => {
            let changes = incremental(
                tx, registry, config, user_id, collections, last_sync_at, request, debug_log,
            )
            .await?;
            Ok(PullOutcome {
                changes,
                next_cursor: None,
                sync_started_at: None,
                synced_at,
            })
        }
        None => initial(tx, registry, config, user_id, collections, request, synced_at, debug_log)
            .await,
    }
}

// ============================================================================
// Incremental
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn incremental(
    tx: &Transaction<'_>,
    registry: &SchemaRegistry,
    config: &EdgeConfig,
    user_id: &str,
    collections: &HashMap<String, Vec<String>>,
    last_sync_at: &str,
    request: &SyncRequest,
    debug_log: &mut Vec<String>,
) -> Result<Vec<ChangeRow>> {
    let cutoff = normalize::normalize_timestamp(last_sync_at);

    // The change log bounds the scan to tables that actually moved.
    let changed: HashSet<String> = tx
        .query(
            "SELECT table_name FROM sync_table_log WHERE changed_at > $1",
            &[&PgValue::Text(cutoff.clone())],
        )
        .await?
        .iter()
        .map(|row| row.get::<_, String>(0))
        .collect();
    if changed.is_empty() {
        return Ok(Vec::new());
    }

    let mut changes = Vec::new();
    for table in registry.syncable_tables() {
        if !changed.contains(table) {
            continue;
        }
        if let Some(allow) = &request.pull_tables {
            if !allow.contains(table) {
                continue;
            }
        }
        let schema = match registry.table(table) {
            Some(s) => s,
            None => continue,
        };
        let Some(lmc) = schema.last_modified_column.clone() else {
            continue;
        };

        let rule = config.pull_rules.get(table);
        let rows = match rule {
            Some(PullRule::Rpc { function, params }) => {
                rpc_rows(tx, function, params, user_id, Some(&cutoff), None, None).await?
            }
            _ => {
                let mut next_param = 1;
                let predicate = match rule {
                    Some(rule) => rules::compile(rule, user_id, collections, &mut next_param),
                    None => Compiled::Predicate(rules::heuristic(user_id, &mut next_param)),
                };
                let predicate = match predicate {
                    Compiled::Predicate(p) => p,
                    Compiled::Skip => {
                        debug!(table = %table, "incremental pull skips table for this user");
                        continue;
                    }
                    Compiled::Rpc { .. } => unreachable!("rpc handled above"),
                };
                let sql = format!(
                    "SELECT * FROM {table} WHERE ({}) AND {lmc} > ${next_param}",
                    predicate.sql
                );
                let mut params = predicate.params;
                params.push(PgValue::Text(cutoff.clone()));
                tx.query(&sql, &params_ref(&params)).await?
            }
        };

        if config.diagnostics {
            debug_log.push(format!("incremental {table}: {} rows", rows.len()));
        }
        for row in &rows {
            changes.push(row_to_change(row, schema, registry));
        }
    }
    Ok(changes)
}

// ============================================================================
// Initial (paginated)
// ============================================================================

/// How pagination proceeds after one table contributed `got` rows to a
/// page with `remaining` slots.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Page is full; resume inside the same table at the new offset.
    PageFull { next_offset: i64 },
    /// Table exhausted; move to the next table at offset 0.
    NextTable,
}

fn cursor_step(offset: i64, got: usize, remaining: i64) -> Step {
    if got as i64 == remaining {
        Step::PageFull {
            next_offset: offset + got as i64,
        }
    } else {
        Step::NextTable
    }
}

#[allow(clippy::too_many_arguments)]
async fn initial(
    tx: &Transaction<'_>,
    registry: &SchemaRegistry,
    config: &EdgeConfig,
    user_id: &str,
    collections: &HashMap<String, Vec<String>>,
    request: &SyncRequest,
    synced_at: String,
    debug_log: &mut Vec<String>,
) -> Result<PullOutcome> {
    let cursor = match &request.pull_cursor {
        Some(raw) => PullCursor::decode(raw)?,
        None => PullCursor::new(0, 0, ""),
    };
    // The snapshot freezes at the echoed watermark; a fresh sync starts one.
    let sync_started_at = request
        .sync_started_at
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            Some(cursor.sync_started_at.clone()).filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| synced_at.clone());

    let page_size = clamp_page_size(request.page_size);
    let tables = registry.syncable_tables();

    let mut collected: Vec<ChangeRow> = Vec::new();
    let mut next_cursor: Option<PullCursor> = None;
    let mut idx = cursor.table_index;
    let mut offset = cursor.offset.max(0);

    while idx < tables.len() {
        let table = &tables[idx];
        let schema = match registry.table(table) {
            Some(s) => s,
            None => {
                idx += 1;
                offset = 0;
                continue;
            }
        };
        if let Some(allow) = &request.pull_tables {
            if !allow.contains(table) {
                idx += 1;
                offset = 0;
                continue;
            }
        }

        let remaining = page_size - collected.len() as i64;
        let rows = initial_table_page(
            tx,
            schema,
            config,
            user_id,
            collections,
            &sync_started_at,
            remaining,
            offset,
        )
        .await?;
        let rows = match rows {
            Some(rows) => rows,
            None => {
                // No filter resolves for this user; the table is skipped.
                idx += 1;
                offset = 0;
                continue;
            }
        };

        let got = rows.len();
        if config.diagnostics {
            debug_log.push(format!("initial {table}: {got} rows at offset {offset}"));
        }
        for row in &rows {
            collected.push(row_to_change(row, schema, registry));
        }

        match cursor_step(offset, got, remaining) {
            Step::PageFull { next_offset } => {
                next_cursor = Some(PullCursor::new(idx, next_offset, sync_started_at.clone()));
                break;
            }
            Step::NextTable => {
                idx += 1;
                offset = 0;
            }
        }
    }

    Ok(PullOutcome {
        changes: collected,
        next_cursor: next_cursor.map(|c| c.encode()),
        sync_started_at: Some(sync_started_at),
        synced_at,
    })
}

/// One table's contribution to the current page, or None when the user
/// filter rules the table out entirely.
#[allow(clippy::too_many_arguments)]
async fn initial_table_page(
    tx: &Transaction<'_>,
    schema: &TableSchema,
    config: &EdgeConfig,
    user_id: &str,
    collections: &HashMap<String, Vec<String>>,
    sync_started_at: &str,
    limit: i64,
    offset: i64,
) -> Result<Option<Vec<Row>>> {
    let rule = config.pull_rules.get(&schema.name);
    if let Some(PullRule::Rpc { function, params }) = rule {
        let rows = rpc_rows(tx, function, params, user_id, None, Some(limit), Some(offset)).await?;
        return Ok(Some(rows));
    }

    let mut next_param = 1;
    let predicate = match rule {
        Some(rule) => rules::compile(rule, user_id, collections, &mut next_param),
        None => Compiled::Predicate(rules::heuristic(user_id, &mut next_param)),
    };
    let predicate = match predicate {
        Compiled::Predicate(p) => p,
        Compiled::Skip => return Ok(None),
        Compiled::Rpc { .. } => unreachable!("rpc handled above"),
    };

    let mut sql = format!("SELECT * FROM {} WHERE ({})", schema.name, predicate.sql);
    let mut params = predicate.params;
    if let Some(lmc) = &schema.last_modified_column {
        sql.push_str(&format!(" AND {lmc} <= ${next_param}"));
        params.push(PgValue::Text(
            normalize::normalize_timestamp(sync_started_at),
        ));
        next_param += 1;
    }
    // Stable pagination needs a stable order within the snapshot.
    let order_cols = schema.primary_key.columns().join(", ");
    sql.push_str(&format!(
        " ORDER BY {order_cols} LIMIT ${next_param} OFFSET ${}",
        next_param + 1
    ));
    params.push(PgValue::Int(limit));
    params.push(PgValue::Int(offset));

    let rows = tx.query(&sql, &params_ref(&params)).await?;
    Ok(Some(rows))
}

// ============================================================================
// RPC delegation
// ============================================================================

/// `SELECT * FROM fn(user_id, after, limit, offset, …extra)`. Extra static
/// arguments come from the rule's `params` array.
async fn rpc_rows(
    tx: &Transaction<'_>,
    function: &str,
    extra: &Value,
    user_id: &str,
    after: Option<&str>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<Row>> {
    let mut params: Vec<PgValue> = vec![
        PgValue::Text(user_id.to_string()),
        after
            .map(|a| PgValue::Text(normalize::normalize_timestamp(a)))
            .unwrap_or(PgValue::Null),
        limit.map(PgValue::Int).unwrap_or(PgValue::Null),
        offset.map(PgValue::Int).unwrap_or(PgValue::Null),
    ];
    if let Value::Array(extra) = extra {
        params.extend(extra.iter().map(PgValue::from_json));
    }
    let placeholders = (1..=params.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT * FROM {function}({placeholders})");
    Ok(tx.query(&sql, &params_ref(&params)).await?)
}

// ============================================================================
// Row normalization
// ============================================================================

/// Shape a Postgres row for the embedded side.
fn row_to_change(row: &Row, schema: &TableSchema, registry: &SchemaRegistry) -> ChangeRow {
    let mut snake = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        snake.insert(column.name().to_string(), pg_cell_to_json(row, i, column.type_()));
    }

    normalize::sanitize_booleans_to_int(&mut snake, &schema.boolean_columns, registry);

    let row_id = match &schema.primary_key {
        oosync_core::PrimaryKey::Single(col) => snake
            .get(col)
            .map(json_scalar_to_string)
            .unwrap_or_default(),
        oosync_core::PrimaryKey::Composite(cols) => {
            let mut key = Map::new();
            for col in cols {
                key.insert(
                    registry.snake_to_camel(col),
                    snake.get(col).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(key).to_string()
        }
    };

    let last_modified_at = schema
        .last_modified_column
        .as_ref()
        .and_then(|lmc| snake.get(lmc))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    ChangeRow {
        table: schema.name.clone(),
        row_id,
        data: Value::Object(normalize::row_to_camel(snake, registry)),
        // Soft-deleted rows travel with their flag in the data; the wire
        // `deleted` flag is a push-side instruction.
        deleted: false,
        last_modified_at,
    }
}

fn json_scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn pg_cell_to_json(row: &Row, i: usize, ty: &Type) -> Value {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, i: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(i).ok().flatten()
    }

    // `Type` constants are not matchable patterns, hence the guard chain.
    if *ty == Type::BOOL {
        get::<bool>(row, i).map(Value::from).unwrap_or(Value::Null)
    } else if *ty == Type::INT2 {
        get::<i16>(row, i).map(Value::from).unwrap_or(Value::Null)
    } else if *ty == Type::INT4 {
        get::<i32>(row, i).map(Value::from).unwrap_or(Value::Null)
    } else if *ty == Type::INT8 {
        get::<i64>(row, i).map(Value::from).unwrap_or(Value::Null)
    } else if *ty == Type::FLOAT4 {
        get::<f32>(row, i).map(Value::from).unwrap_or(Value::Null)
    } else if *ty == Type::FLOAT8 {
        get::<f64>(row, i).map(Value::from).unwrap_or(Value::Null)
    } else if *ty == Type::TIMESTAMPTZ {
        get::<chrono::DateTime<Utc>>(row, i)
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .unwrap_or(Value::Null)
    } else if *ty == Type::TIMESTAMP {
        get::<chrono::NaiveDateTime>(row, i)
            .map(|t| Value::String(format!("{}Z", t.format("%Y-%m-%dT%H:%M:%S%.3f"))))
            .unwrap_or(Value::Null)
    } else if *ty == Type::DATE {
        get::<chrono::NaiveDate>(row, i)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null)
    } else if *ty == Type::UUID {
        get::<uuid::Uuid>(row, i)
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        get::<Value>(row, i).unwrap_or(Value::Null)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
    {
        get::<String>(row, i).map(Value::String).unwrap_or(Value::Null)
    } else {
        match get::<String>(row, i) {
            Some(s) => Value::String(s),
            None => {
                warn!(column_type = %ty, "unsupported column type in pull; returning null");
                Value::Null
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_page_resumes_within_the_same_table() {
        // 50 rows already collected, table B contributes the remaining 150
        // starting at offset 0 → resume inside B at offset 150.
        assert_eq!(
            cursor_step(0, 150, 150),
            Step::PageFull { next_offset: 150 }
        );
        // Scenario: offset 50, full page of 200 → resume at 250.
        assert_eq!(
            cursor_step(50, 200, 200),
            Step::PageFull { next_offset: 250 }
        );
    }

    #[test]
    fn short_page_moves_to_the_next_table() {
        assert_eq!(cursor_step(0, 150, 200), Step::NextTable);
        assert_eq!(cursor_step(250, 0, 200), Step::NextTable);
    }
}
