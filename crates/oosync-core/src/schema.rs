//! Schema registry: per-table sync metadata with O(1) lookups.
//!
//! The registry is the single source of truth for primary keys, conflict
//! keys, boolean and timestamp columns, soft-delete support, dependency
//! ranks, and the snake↔camel column mapping. It is plain data supplied by
//! the host, not a trait hierarchy.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ============================================================================
// TableSchema
// ============================================================================

/// Primary key of a syncable table: a single column or an ordered tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    /// Primary-key columns in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            PrimaryKey::Single(c) => vec![c.as_str()],
            PrimaryKey::Composite(cs) => cs.iter().map(|c| c.as_str()).collect(),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, PrimaryKey::Composite(_))
    }
}

/// Sync metadata for one table. All column names are snake_case (the
/// authoritative side's convention); the registry derives the camelCase
/// property names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub primary_key: PrimaryKey,
    /// Natural unique key when the primary key is synthetic. Falls back to
    /// the primary key when absent.
    #[serde(default)]
    pub conflict_keys: Option<Vec<String>>,
    #[serde(default)]
    pub boolean_columns: Vec<String>,
    #[serde(default)]
    pub timestamp_columns: Vec<String>,
    /// Column recording the row's last modification time. Presence of this
    /// column is what makes a table eligible for incremental sync.
    #[serde(default)]
    pub last_modified_column: Option<String>,
    /// Column recording the originating device of a write, used to filter
    /// backfill scans after a trigger-suppression window.
    #[serde(default)]
    pub device_column: Option<String>,
    /// When true, deletes mark a `deleted` flag instead of removing the row.
    #[serde(default)]
    pub soft_delete: bool,
    /// Topological rank: lower = referenced-by-others (parents first).
    #[serde(default)]
    pub rank: u32,
    /// When true, composite-key reconciliation adopts the server-provided
    /// synthetic id instead of preserving the local one. Set only on the
    /// canonical user-identity table.
    #[serde(default)]
    pub adopt_server_id: bool,
}

impl TableSchema {
    /// Conflict-target columns: the natural unique key, or the primary key.
    pub fn conflict_columns(&self) -> Vec<&str> {
        match &self.conflict_keys {
            Some(keys) => keys.iter().map(|k| k.as_str()).collect(),
            None => self.primary_key.columns(),
        }
    }

    pub fn supports_incremental(&self) -> bool {
        self.last_modified_column.is_some()
    }
}

// ============================================================================
// SchemaRegistry
// ============================================================================

/// Lookup structure over all syncable tables.
///
/// Construction indexes tables by name; every read afterwards is O(1).
/// Case mapping is memoized because the same column names recur on every
/// row of every page.
pub struct SchemaRegistry {
    tables: HashMap<String, TableSchema>,
    /// Syncable tables ordered by rank (ties broken by declaration order).
    order: Vec<String>,
    camel_cache: Mutex<HashMap<String, String>>,
    snake_cache: Mutex<HashMap<String, String>>,
}

impl SchemaRegistry {
    pub fn new(mut schemas: Vec<TableSchema>) -> Self {
        schemas.sort_by_key(|s| s.rank);
        let order = schemas.iter().map(|s| s.name.clone()).collect();
        let tables = schemas.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self {
            tables,
            order,
            camel_cache: Mutex::new(HashMap::new()),
            snake_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn is_syncable(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Syncable tables in sync order (parents before children).
    pub fn syncable_tables(&self) -> &[String] {
        &self.order
    }

    pub fn primary_key(&self, table: &str) -> Option<&PrimaryKey> {
        self.tables.get(table).map(|t| &t.primary_key)
    }

    pub fn conflict_keys(&self, table: &str) -> Vec<&str> {
        self.tables
            .get(table)
            .map(|t| t.conflict_columns())
            .unwrap_or_default()
    }

    pub fn boolean_columns(&self, table: &str) -> &[String] {
        self.tables
            .get(table)
            .map(|t| t.boolean_columns.as_slice())
            .unwrap_or(&[])
    }

    pub fn timestamp_columns(&self, table: &str) -> &[String] {
        self.tables
            .get(table)
            .map(|t| t.timestamp_columns.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_deleted_flag(&self, table: &str) -> bool {
        self.tables.get(table).map(|t| t.soft_delete).unwrap_or(false)
    }

    pub fn supports_incremental(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .map(|t| t.supports_incremental())
            .unwrap_or(false)
    }

    pub fn rank(&self, table: &str) -> u32 {
        self.tables.get(table).map(|t| t.rank).unwrap_or(u32::MAX)
    }

    // -----------------------------------------------------------------------
    // Case mapping
    // -----------------------------------------------------------------------

    /// `snake_case` column name → `camelCase` property name. Memoized.
    pub fn snake_to_camel(&self, column: &str) -> String {
        if let Some(hit) = self.camel_cache.lock().get(column) {
            return hit.clone();
        }
        let camel = snake_to_camel(column);
        self.camel_cache
            .lock()
            .insert(column.to_string(), camel.clone());
        camel
    }

    /// `camelCase` property name → `snake_case` column name. Memoized.
    pub fn camel_to_snake(&self, property: &str) -> String {
        if let Some(hit) = self.snake_cache.lock().get(property) {
            return hit.clone();
        }
        let snake = camel_to_snake(property);
        self.snake_cache
            .lock()
            .insert(property.to_string(), snake.clone());
        snake
    }
}

// ============================================================================
// Case conversion
// ============================================================================

fn snake_to_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;
    for ch in s.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for ch in s.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
