//! Edge environment: connection string, JWT verification key, and the
//! per-table rule configuration. Rule maps arrive as JSON blobs so a
//! deployment can reconfigure tables without a rebuild.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EdgeError, Result};
use oosync_core::{PullRule, TableSchema};

// ============================================================================
// Per-table push rules
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizeRules {
    /// Properties coerced from numeric strings to numbers.
    #[serde(default)]
    pub numeric_props: Vec<String>,
    /// Properties where an empty string becomes NULL.
    #[serde(default)]
    pub blank_to_null_props: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRules {
    /// Refuse DELETE for append-only tables (logged, still a success).
    #[serde(default)]
    pub deny_delete: bool,
    /// Columns excluded from the upsert SET clause.
    #[serde(default)]
    pub omit_set_props: Vec<String>,
    /// When set, a failed upsert is retried with the payload stripped to
    /// these properties.
    #[serde(default)]
    pub retry_keep_props: Vec<String>,
    #[serde(default)]
    pub sanitize: SanitizeRules,
}

/// Named collection of owned ids, referenced by `inCollection` pull rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDef {
    pub table: String,
    pub id_column: String,
    pub owner_column: String,
}

// ============================================================================
// JWT verification
// ============================================================================

#[derive(Debug, Clone)]
pub enum JwtVerifier {
    /// Shared secret.
    Hs256 { secret: String },
    /// Public key set fetched from the issuer's JWKS endpoint.
    Es256 { jwks_url: String },
}

// ============================================================================
// EdgeConfig
// ============================================================================

pub struct EdgeConfig {
    pub database_url: String,
    pub verifier: JwtVerifier,
    /// Syncable-table schemas, loaded into the registry.
    pub tables: Vec<TableSchema>,
    pub table_rules: HashMap<String, TableRules>,
    pub pull_rules: HashMap<String, PullRule>,
    pub collections: HashMap<String, CollectionDef>,
    /// When on, the handler accumulates `debug` lines into responses.
    pub diagnostics: bool,
    /// Push/pull phases slower than this are logged as warnings.
    pub slow_query_ms: u64,
    pub bind_addr: String,
}

impl EdgeConfig {
    /// Read configuration from the environment. `OOSYNC_DATABASE_URL`,
    /// `OOSYNC_SCHEMA`, and one of `OOSYNC_JWT_SECRET` / `OOSYNC_JWKS_URL`
    /// are required.
    pub fn from_env() -> Result<Self> {
        let database_url = require("OOSYNC_DATABASE_URL")?;
        let verifier = match std::env::var("OOSYNC_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => JwtVerifier::Hs256 { secret },
            _ => match std::env::var("OOSYNC_JWKS_URL") {
                Ok(url) if !url.is_empty() => JwtVerifier::Es256 { jwks_url: url },
                _ => {
                    return Err(EdgeError::Config(
                        "neither OOSYNC_JWT_SECRET nor OOSYNC_JWKS_URL is set".to_string(),
                    ))
                }
            },
        };

        let tables: Vec<TableSchema> = parse_json_env("OOSYNC_SCHEMA")?.ok_or_else(|| {
            EdgeError::Config("OOSYNC_SCHEMA is not set".to_string())
        })?;

        Ok(Self {
            database_url,
            verifier,
            tables,
            table_rules: parse_json_env("OOSYNC_TABLE_RULES")?.unwrap_or_default(),
            pull_rules: parse_json_env("OOSYNC_PULL_RULES")?.unwrap_or_default(),
            collections: parse_json_env("OOSYNC_COLLECTIONS")?.unwrap_or_default(),
            diagnostics: std::env::var("OOSYNC_DIAGNOSTICS").map(|v| v == "1" || v == "true").unwrap_or(false),
            slow_query_ms: std::env::var("OOSYNC_SLOW_QUERY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            bind_addr: std::env::var("OOSYNC_BIND").unwrap_or_else(|_| "0.0.0.0:8787".to_string()),
        })
    }

    pub fn rules_for(&self, table: &str) -> TableRules {
        self.table_rules.get(table).cloned().unwrap_or_default()
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EdgeError::Config(format!("{name} is not set")))
}

fn parse_json_env<T: serde::de::DeserializeOwned>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => {
            let parsed = serde_json::from_str(&raw)
                .map_err(|e| EdgeError::Config(format!("{name} is not valid JSON: {e}")))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_rules_parse_from_config_json() {
        let raw = r#"{
            "practice_record": {
                "denyDelete": true,
                "omitSetProps": ["id"],
                "sanitize": {"numericProps": ["quality"], "blankToNullProps": ["note"]}
            }
        }"#;
        let rules: HashMap<String, TableRules> = serde_json::from_str(raw).unwrap();
        let pr = &rules["practice_record"];
        assert!(pr.deny_delete);
        assert_eq!(pr.omit_set_props, vec!["id"]);
        assert_eq!(pr.sanitize.numeric_props, vec!["quality"]);
        assert!(pr.retry_keep_props.is_empty());
    }
}
