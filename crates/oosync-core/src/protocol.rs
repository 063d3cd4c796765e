//! Wire protocol for `POST /api/sync`: request/response shapes shared by
//! the client engine and the edge handler. All field names serialize in
//! camelCase to match the JSON contract.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default rows per pull page when the client sends no hint.
pub const DEFAULT_PAGE_SIZE: i64 = 200;
/// Hard ceiling on rows per pull page.
pub const MAX_PAGE_SIZE: i64 = 500;

// ============================================================================
// Change rows
// ============================================================================

/// Outbox operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Insert => "INSERT",
            Op::Update => "UPDATE",
            Op::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Op> {
        match s {
            "INSERT" => Some(Op::Insert),
            "UPDATE" => Some(Op::Update),
            "DELETE" => Some(Op::Delete),
            _ => None,
        }
    }
}

/// One row travelling in either direction.
///
/// `row_id` is the primary-key value as a string, or a JSON-encoded object
/// of the composite key columns (camelCase keys). `data` carries the row
/// properties in camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
    pub table: String,
    pub row_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<String>,
}

/// Decode a row id into its key components. A JSON object yields its
/// entries (camelCase keys); anything else is treated as a single
/// synthetic `id`. Stable in both directions of the protocol.
pub fn parse_row_id(row_id: &str) -> Map<String, Value> {
    if row_id.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(row_id) {
            return map;
        }
    }
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(row_id.to_string()));
    map
}

// ============================================================================
// Request / response
// ============================================================================

/// Per-request replacement of a named collection's id set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionsOverride {
    #[serde(default)]
    pub selected_genres: Vec<String>,
}

/// Explicit effective genre id sets for this request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreFilter {
    #[serde(default)]
    pub selected_genre_ids: Vec<String>,
    #[serde(default)]
    pub playlist_genre_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub changes: Vec<ChangeRow>,
    /// Absent ⇒ initial sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
    #[serde(default)]
    pub schema_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_cursor: Option<String>,
    /// Echoed snapshot watermark when continuing an initial sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections_override: Option<CollectionsOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre_filter: Option<GenreFilter>,
    /// Allowlist of tables for this pull.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub changes: Vec<ChangeRow>,
    pub synced_at: String,
    /// Present ⇒ more pages remain for this initial sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Vec<String>>,
}

// ============================================================================
// Page size
// ============================================================================

/// Clamp a client page-size hint. Absent or below 1 falls back to the
/// default; above the ceiling clamps to it.
pub fn clamp_page_size(hint: Option<i64>) -> i64 {
    match hint {
        Some(n) if n >= 1 && n <= MAX_PAGE_SIZE => n,
        Some(n) if n > MAX_PAGE_SIZE => MAX_PAGE_SIZE,
        _ => DEFAULT_PAGE_SIZE,
    }
}

// ============================================================================
// Tests
// ============================================================================
