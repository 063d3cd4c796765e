//! Edge sync endpoint binary.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use oosync_edge::{router, AppState, EdgeConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EdgeConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "oosync edge listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
