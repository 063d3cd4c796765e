//! Row normalization applied identically on both sides of the wire:
//! timestamp canonicalization, boolean↔0/1 mapping, and registry-driven
//! key case mapping.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::schema::SchemaRegistry;

// ============================================================================
// Timestamps
// ============================================================================

/// Trailing explicit zone: `Z`, `+HH:MM`, `-HHMM`, …
fn zone_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(Z|[+-]\d{2}:?\d{2})$").unwrap())
}

/// Canonicalize a timestamp string to ISO-8601 with an explicit zone:
/// the first space becomes `T`, and `Z` is appended when no zone is
/// present. Already-canonical values pass through unchanged.
pub fn normalize_timestamp(raw: &str) -> String {
    let mut out = raw.trim().replacen(' ', "T", 1);
    if !zone_suffix().is_match(&out) {
        out.push('Z');
    }
    out
}

/// Normalize every timestamp property of a row in place. `columns` are
/// snake_case; the row may carry either casing.
pub fn normalize_timestamp_props(row: &mut Map<String, Value>, columns: &[String], registry: &SchemaRegistry) {
    for col in columns {
        let camel = registry.snake_to_camel(col);
        for key in [col.as_str(), camel.as_str()] {
            if let Some(Value::String(s)) = row.get(key) {
                let normalized = normalize_timestamp(s);
                row.insert(key.to_string(), Value::String(normalized));
            }
        }
    }
}

// ============================================================================
// Booleans
// ============================================================================

/// Map boolean properties of a row to integer 0/1 (the embedded DB's
/// representation). Accepts booleans, numbers, and "true"/"false" strings.
pub fn sanitize_booleans_to_int(row: &mut Map<String, Value>, columns: &[String], registry: &SchemaRegistry) {
    for col in columns {
        let camel = registry.snake_to_camel(col);
        for key in [col.as_str(), camel.as_str()] {
            if let Some(v) = row.get(key) {
                if let Some(b) = coerce_bool(v) {
                    row.insert(key.to_string(), Value::from(i64::from(b)));
                }
            }
        }
    }
}

/// Map integer 0/1 boolean properties to real booleans (the authoritative
/// DB's representation).
pub fn sanitize_booleans_to_bool(row: &mut Map<String, Value>, columns: &[String], registry: &SchemaRegistry) {
    for col in columns {
        let camel = registry.snake_to_camel(col);
        for key in [col.as_str(), camel.as_str()] {
            if let Some(v) = row.get(key) {
                if let Some(b) = coerce_bool(v) {
                    row.insert(key.to_string(), Value::Bool(b));
                }
            }
        }
    }
}

fn coerce_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ============================================================================
// Key casing
// ============================================================================

/// Re-key a row's properties from snake_case columns to camelCase.
pub fn row_to_camel(row: Map<String, Value>, registry: &SchemaRegistry) -> Map<String, Value> {
    row.into_iter()
        .map(|(k, v)| (registry.snake_to_camel(&k), v))
        .collect()
}

/// Re-key a row's properties from camelCase to snake_case columns.
pub fn row_to_snake(row: Map<String, Value>, registry: &SchemaRegistry) -> Map<String, Value> {
    row.into_iter()
        .map(|(k, v)| (registry.camel_to_snake(&k), v))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
