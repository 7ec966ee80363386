//! WebSocket ingestion gateway.
//!
//! Accepts bot connections, maintains one [`session::Session`] per
//! connection, and emits `session_start` / `transcription` / `session_end`
//! records onto the outbound segment stream for the collector.

mod outbound;
mod registry;
mod session;
mod ws;

pub use outbound::CollectorRelay;
pub use registry::{Admission, ClientRegistry};
pub use session::Session;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use crate::asr::{build_transcriber, Transcriber};
use crate::config::GatewayConfig;
use crate::error::{ColloquyError, ColloquyResult};

/// Shared state for the gateway's axum handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<ClientRegistry>,
    pub relay: CollectorRelay,
    pub transcriber: Arc<dyn Transcriber>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Builds the gateway router. Exposed separately for tests.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", any(ws::ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Runs the gateway until the token is cancelled.
pub async fn run(config: GatewayConfig, cancel: CancellationToken) -> ColloquyResult<()> {
    let relay = CollectorRelay::connect(&config.redis_url, &config.stream_name).await?;
    let transcriber = build_transcriber(&config)?;
    let registry = Arc::new(ClientRegistry::new(
        config.max_clients,
        Duration::from_secs(config.max_connection_time_secs),
    ));

    let state = GatewayState {
        registry,
        relay,
        transcriber,
    };

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| ColloquyError::Configuration(format!("gateway bind failed: {e}")))?;
    log::info!("[WS] Gateway listening on ws://{}/ws", config.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ColloquyError::Internal(format!("gateway server error: {e}")))
}
