//! Sync transport: the single request/response seam between the client
//! engine and the edge endpoint, plus the HTTP implementation used in
//! production. Tests substitute a scripted in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oosync_core::{SyncRequest, SyncResponse};

// ============================================================================
// Transport trait
// ============================================================================

/// One protocol exchange: push a batch of changes, receive a page of
/// remote changes. The response is always a page (possibly empty); the
/// client never invents pagination state.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError>;
}

// ============================================================================
// Transport errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Fetch-level failure: DNS, refused, disconnected, timeout.
    Network,
    /// 401 from the edge.
    Auth,
    /// Non-2xx from the edge (other than 401).
    Server,
    /// Malformed request or response body.
    Protocol,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub kind: TransportErrorKind,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Network,
            status: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Protocol,
            status: None,
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let kind = if status == 401 {
            TransportErrorKind::Auth
        } else {
            TransportErrorKind::Server
        };
        Self {
            message: body.into(),
            kind,
            status: Some(status),
        }
    }

    pub fn is_network(&self) -> bool {
        if self.kind == TransportErrorKind::Network {
            return true;
        }
        // Browser-origin hosts forward their fetch failures as message text.
        const NETWORK_MARKERS: [&str; 3] =
            ["Failed to fetch", "NetworkError", "ERR_INTERNET_DISCONNECTED"];
        NETWORK_MARKERS.iter().any(|m| self.message.contains(m))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "sync request failed ({status}): {}", self.message),
            None => write!(f, "sync request failed: {}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

// ============================================================================
// HttpWorkerClient
// ============================================================================

/// Supplies the current bearer token; returning `None` sends the request
/// unauthenticated (the edge will answer 401).
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-over-HTTPS transport against the edge's `POST /api/sync`.
pub struct HttpWorkerClient {
    endpoint: String,
    http: reqwest::Client,
    token_provider: TokenProvider,
}

impl HttpWorkerClient {
    pub fn new(endpoint: impl Into<String>, token_provider: TokenProvider) -> Self {
        Self::with_timeout(endpoint, token_provider, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        token_provider: TokenProvider,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.into(),
            http,
            token_provider,
        }
    }
}

#[async_trait]
impl SyncTransport for HttpWorkerClient {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let mut builder = self.http.post(&self.endpoint).json(request);
        if let Some(token) = (self.token_provider)() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                TransportError::network(e.to_string())
            } else {
                TransportError::protocol(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), body));
        }

        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| TransportError::protocol(format!("invalid sync response: {e}")))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_markers_are_detected() {
        let e = TransportError::protocol("TypeError: Failed to fetch");
        assert!(e.is_network());
        let e = TransportError::from_status(500, "boom");
        assert!(!e.is_network());
        let e = TransportError::network("connection refused");
        assert!(e.is_network());
    }

    #[test]
    fn status_maps_to_kind() {
        assert_eq!(
            TransportError::from_status(401, "").kind,
            TransportErrorKind::Auth
        );
        assert_eq!(
            TransportError::from_status(500, "").kind,
            TransportErrorKind::Server
        );
    }
}
