//! HTTP surface of the decision listener: live SSE, snapshots, summaries,
//! and tracker configuration.
//!
//! All handlers are thin; state lives in the engine, the decision log, and
//! the tracker store.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::window::DecisionEngine;
use super::{summarize_items, DecisionLog};
use crate::error::ColloquyResult;
use crate::limits;
use crate::llm::LlmClient;
use crate::tracker::{TrackerConfig, TrackerStore};

#[derive(Clone)]
pub struct DecisionHttpState {
    pub engine: Arc<DecisionEngine>,
    pub log: DecisionLog,
    pub llm: LlmClient,
    pub tracker: Arc<TrackerStore>,
}

pub fn router(state: DecisionHttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/decisions/{meeting_id}", get(decisions_sse))
        .route("/decisions/{meeting_id}/all", get(decisions_all))
        .route("/summary/{meeting_id}", get(summary))
        .route("/config", get(config_get).put(config_put))
        .route("/config/reset", post(config_reset))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Live item stream. Late subscribers receive only future items; history
/// comes from the `/all` snapshot.
async fn decisions_sse(
    Path(meeting_id): Path<String>,
    State(state): State<DecisionHttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.engine.subscribe(&meeting_id);

    let connected = stream::once(async { Ok(Event::default().comment("connected")) });
    let items = BroadcastStream::new(rx).filter_map(move |result| {
        futures::future::ready(match result {
            Ok(item) => Event::default().json_data(&item).ok().map(Ok),
            Err(BroadcastStreamRecvError::Lagged(dropped)) => {
                // Bounded queue: this subscriber lost the oldest items.
                log::warn!(
                    "[SSE] Subscriber for {meeting_id} lagged, dropped {dropped} items"
                );
                None
            }
        })
    });

    Sse::new(connected.chain(items)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(limits::SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    )
}

/// Snapshot of every stored decision for the meeting, in insertion order.
async fn decisions_all(
    Path(meeting_id): Path<String>,
    State(state): State<DecisionHttpState>,
) -> ColloquyResult<Json<serde_json::Value>> {
    let items = state.log.all(&meeting_id).await?;
    Ok(Json(json!({
        "meeting_id": meeting_id,
        "count": items.len(),
        "items": items,
    })))
}

/// Lightweight lede/theme summary derived from the stored items.
async fn summary(
    Path(meeting_id): Path<String>,
    State(state): State<DecisionHttpState>,
) -> ColloquyResult<Json<serde_json::Value>> {
    let items = state.log.all(&meeting_id).await?;
    if items.is_empty() {
        return Ok(Json(json!({
            "meeting_id": meeting_id,
            "summary": {"lede": "", "theme": ""},
            "item_count": 0,
        })));
    }
    let summary = summarize_items(&state.llm, &items).await?;
    Ok(Json(json!({
        "meeting_id": meeting_id,
        "summary": summary,
        "item_count": items.len(),
    })))
}

async fn config_get(State(state): State<DecisionHttpState>) -> Json<TrackerConfig> {
    Json(state.tracker.get().as_ref().clone())
}

async fn config_put(
    State(state): State<DecisionHttpState>,
    Json(config): Json<TrackerConfig>,
) -> Json<TrackerConfig> {
    let updated = state.tracker.set(config);
    log::info!("[Decisions] Tracker config updated");
    Json(updated.as_ref().clone())
}

async fn config_reset(State(state): State<DecisionHttpState>) -> Json<TrackerConfig> {
    let defaults = state.tracker.reset();
    log::info!("[Decisions] Tracker config reset to defaults");
    Json(defaults.as_ref().clone())
}
