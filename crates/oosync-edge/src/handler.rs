//! Request handler: one stateless `POST /api/sync` that authenticates,
//! opens a single request-scoped transaction, applies the push, computes
//! the pull, and commits. Connections are never reused across requests;
//! any error before the commit rolls the whole exchange back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_postgres::{NoTls, Transaction};
use tracing::{error, info, warn};

use crate::auth::{self, JwksCache};
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::pg::PgValue;
use crate::{pull, push};
use oosync_core::{SchemaRegistry, SyncRequest, SyncResponse};

pub struct AppState {
    pub config: EdgeConfig,
    pub registry: Arc<SchemaRegistry>,
    pub jwks: JwksCache,
}

impl AppState {
    pub fn new(config: EdgeConfig) -> Self {
        let registry = Arc::new(SchemaRegistry::new(config.tables.clone()));
        Self {
            config,
            registry,
            jwks: JwksCache::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sync", post(sync_handler).options(preflight))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// CORS preflight for browser clients.
async fn preflight() -> Response {
    use axum::http::HeaderValue;
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, content-type"),
    );
    response
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> std::result::Result<Response, EdgeError> {
    let started = Instant::now();

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let user_id = auth::verify_bearer(auth_header, &state.config.verifier, &state.jwks).await?;

    // Request-scoped connection: opened here, dropped on return. No pool,
    // no cross-request prepared statements.
    let (mut client, connection) =
        tokio_postgres::connect(&state.config.database_url, NoTls).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "postgres connection task failed");
        }
    });

    let result = run_exchange(&state, &mut client, &user_id, &request).await;

    drop(client);
    driver.abort();

    let elapsed = started.elapsed().as_millis() as u64;
    if elapsed > state.config.slow_query_ms {
        warn!(user = %user_id, elapsed_ms = elapsed, "slow sync exchange");
    }

    let response = result?;
    info!(
        user = %user_id,
        pushed = request.changes.len(),
        pulled = response.changes.len(),
        elapsed_ms = elapsed,
        "sync exchange completed"
    );
    let mut http = Json(response).into_response();
    http.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        axum::http::HeaderValue::from_static("*"),
    );
    Ok(http)
}

/// Push + pull under one transaction. Any error propagates before the
/// commit, rolling everything back.
async fn run_exchange(
    state: &AppState,
    client: &mut tokio_postgres::Client,
    user_id: &str,
    request: &SyncRequest,
) -> Result<SyncResponse> {
    let mut tx = client.transaction().await?;
    let collections = load_collections(&tx, &state.config, user_id, request).await?;

    let mut debug_log = Vec::new();
    let push_summary = push::apply_push(
        &mut tx,
        &state.registry,
        &state.config,
        &request.changes,
        &mut debug_log,
    )
    .await?;
    // A statement-level failure fails the batch: the client keeps its
    // outbox items pending and retries the idempotent upserts later.
    if !push_summary.errors.is_empty() {
        return Err(EdgeError::Push(push_summary.errors.join("; ")));
    }

    let page = pull::compute_pull(
        &tx,
        &state.registry,
        &state.config,
        user_id,
        &collections,
        request,
        &mut debug_log,
    )
    .await?;
    tx.commit().await?;

    Ok(SyncResponse {
        changes: page.changes,
        synced_at: page.synced_at,
        next_cursor: page.next_cursor,
        sync_started_at: page.sync_started_at,
        error: None,
        debug: state.config.diagnostics.then_some(debug_log),
    })
}

/// Per-request collections: for each configured name, the ids the user
/// owns. The request can replace or refine them.
async fn load_collections(
    tx: &Transaction<'_>,
    config: &EdgeConfig,
    user_id: &str,
    request: &SyncRequest,
) -> Result<HashMap<String, Vec<String>>> {
    let mut out = HashMap::new();
    for (name, def) in &config.collections {
        let sql = format!(
            "SELECT {}::text FROM {} WHERE {} = $1",
            def.id_column, def.table, def.owner_column
        );
        let rows = tx
            .query(&sql, &[&PgValue::Text(user_id.to_string())])
            .await?;
        let ids: Vec<String> = rows.iter().map(|r| r.get::<_, String>(0)).collect();
        out.insert(name.clone(), ids);
    }

    if let Some(overrides) = &request.collections_override {
        out.insert("selectedGenres".to_string(), overrides.selected_genres.clone());
    }
    if let Some(filter) = &request.genre_filter {
        let mut ids = filter.selected_genre_ids.clone();
        for id in &filter.playlist_genre_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        out.insert("selectedGenres".to_string(), ids);
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_answers_ok() {
        let response = health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn preflight_carries_cors_headers() {
        let response = preflight().await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("authorization"));
    }

    #[test]
    fn config_errors_never_leak_details() {
        let response =
            EdgeError::Config("OOSYNC_JWT_SECRET is not set".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // Body shape is checked at the error module; the point here is the
        // variant maps to 500 rather than echoing the variable name.
    }

    #[test]
    fn unauthorized_maps_to_401() {
        let response = EdgeError::Unauthorized("expired".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
