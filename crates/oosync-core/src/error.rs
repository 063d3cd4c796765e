use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid pull cursor: {0}")]
    BadCursor(String),

    #[error("Unsupported cursor version {found} (supported: {supported})")]
    UnsupportedCursorVersion { found: u32, supported: u32 },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
