//! Host-runtime contract: everything the embedding application supplies
//! to the engine. The engine never owns the local database; it borrows the
//! raw handle through these hooks and mutates rows only under trigger
//! suppression.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use oosync_core::Op;

// ============================================================================
// Outbox backup blob
// ============================================================================

/// One-shot outbox snapshot written by the host when it recreates the
/// local schema, replayed by the engine on the next initial sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxBackup {
    pub version: u32,
    pub created_at: String,
    pub items: Vec<OutboxBackupItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxBackupItem {
    pub table: String,
    pub row_id: String,
    pub op: Op,
    pub changed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_data: Option<Value>,
}

// ============================================================================
// HostHooks
// ============================================================================

/// Host-supplied runtime services.
///
/// `sqlite()` hands out the raw embedded-DB handle behind a mutex; lock
/// scope is per operation, never across an await. Trigger enable/suppress
/// are primitives over that handle; hosts that use the default trigger
/// DDL from [`crate::triggers`] can delegate to its helpers.
#[async_trait]
pub trait HostHooks: Send + Sync {
    fn sqlite(&self) -> Arc<Mutex<Connection>>;

    fn enable_sync_triggers(&self, conn: &Connection) -> Result<()>;

    fn suppress_sync_triggers(&self, conn: &Connection) -> Result<()>;

    /// Snapshot the embedded DB image to durable storage. Best effort:
    /// callers log failures and continue.
    async fn persist_db(&self) -> Result<()> {
        Ok(())
    }

    fn is_online(&self) -> bool {
        true
    }

    /// Resolve once connectivity returns. The default resolves
    /// immediately, which degrades the startup pull to plain retries.
    async fn wait_online(&self) {}

    fn load_outbox_backup(&self, _user_id: &str) -> Result<Option<OutboxBackup>> {
        Ok(None)
    }

    fn clear_outbox_backup(&self, _user_id: &str) -> Result<()> {
        Ok(())
    }
}
