//! Opaque pull cursor for paginated initial sync.
//!
//! The cursor is base64-encoded JSON of `{version, tableIndex, offset,
//! syncStartedAt}`. The client never constructs one; it only echoes what
//! the edge returned, together with `syncStartedAt` to freeze the snapshot
//! window.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Current cursor format version.
pub const CURSOR_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCursor {
    pub version: u32,
    /// Index into the syncable-tables order.
    pub table_index: usize,
    /// Row offset within the current table's snapshot.
    pub offset: i64,
    /// Snapshot watermark the pagination is frozen to.
    pub sync_started_at: String,
}

impl PullCursor {
    pub fn new(table_index: usize, offset: i64, sync_started_at: impl Into<String>) -> Self {
        Self {
            version: CURSOR_VERSION,
            table_index,
            offset,
            sync_started_at: sync_started_at.into(),
        }
    }

    pub fn encode(&self) -> String {
        // Serialization of a plain struct cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        let bytes = STANDARD
            .decode(raw.trim())
            .map_err(|e| CoreError::BadCursor(e.to_string()))?;
        let cursor: PullCursor =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::BadCursor(e.to_string()))?;
        if cursor.version != CURSOR_VERSION {
            return Err(CoreError::UnsupportedCursorVersion {
                found: cursor.version,
                supported: CURSOR_VERSION,
            });
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let cursor = PullCursor::new(3, 450, "2026-02-01T10:00:00Z");
        let decoded = PullCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn garbage_is_a_bad_cursor() {
        assert!(matches!(
            PullCursor::decode("not base64!!"),
            Err(CoreError::BadCursor(_))
        ));
        let not_json = STANDARD.encode(b"plain text");
        assert!(matches!(
            PullCursor::decode(&not_json),
            Err(CoreError::BadCursor(_))
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut cursor = PullCursor::new(0, 0, "2026-02-01T10:00:00Z");
        cursor.version = 99;
        let raw = STANDARD.encode(serde_json::to_vec(&cursor).unwrap());
        assert!(matches!(
            PullCursor::decode(&raw),
            Err(CoreError::UnsupportedCursorVersion { found: 99, .. })
        ));
    }
}
