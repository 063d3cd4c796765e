use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Cannot syncDown while pending changes exist")]
    PendingChanges,

    #[error("Push is disabled in pull-only mode")]
    PushDisabled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Host hook failed: {0}")]
    Host(String),

    #[error(transparent)]
    Core(#[from] oosync_core::CoreError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Network-class failures are retried silently: no toast, watermark
    /// untouched.
    pub fn is_network(&self) -> bool {
        matches!(self, ClientError::Transport(t) if t.is_network())
    }
}
