use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EdgeError>;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("Push failed: {0}")]
    Push(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Key fetch failed: {0}")]
    Jwks(String),

    #[error(transparent)]
    Core(#[from] oosync_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            EdgeError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, format!("Unauthorized: {m}")),
            // Never leak which variable is missing.
            EdgeError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server configuration error".to_string(),
            ),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };
        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}
