//! Decision listener: pub/sub window engine, durable decision log, and the
//! SSE/config HTTP surface.

mod dedup;
mod http;
mod listener;
mod window;

pub use dedup::{containment, is_duplicate, jaccard, tokenize};
pub use http::{router, DecisionHttpState};
pub use window::DecisionEngine;

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{DecisionConfig, LlmConfig};
use crate::error::{ColloquyError, ColloquyResult};
use crate::limits::decisions_key;
use crate::llm::LlmClient;
use crate::tracker::TrackerStore;

/// An entity referenced by a captured item. `id` is a slug that identifies
/// the same entity across items within one meeting's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub label: String,
    pub id: String,
}

/// One LLM-captured meeting item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub summary: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<String>,
}

/// Append-only per-meeting decision log in Redis, TTL-refreshed on every
/// append so an active meeting's log never expires mid-meeting.
#[derive(Clone)]
pub struct DecisionLog {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl DecisionLog {
    pub fn new(conn: ConnectionManager, ttl_secs: u64) -> Self {
        Self { conn, ttl_secs }
    }

    pub async fn append(&self, meeting_id: &str, item: &DecisionItem) -> ColloquyResult<()> {
        let key = decisions_key(meeting_id);
        let payload = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(&key, payload).await?;
        let _: bool = conn.expire(&key, self.ttl_secs as i64).await?;
        Ok(())
    }

    /// All items in insertion order. Unparseable rows are skipped.
    pub async fn all(&self, meeting_id: &str) -> ColloquyResult<Vec<DecisionItem>> {
        let key = decisions_key(meeting_id);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(&key, 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|row| serde_json::from_str(row).ok())
            .collect())
    }

    /// Stored summaries, used by the dedup gate.
    pub async fn summaries(&self, meeting_id: &str) -> ColloquyResult<Vec<String>> {
        Ok(self
            .all(meeting_id)
            .await?
            .into_iter()
            .map(|item| item.summary)
            .collect())
    }
}

/// One-call lede/theme summary over the stored items.
pub async fn summarize_items(llm: &LlmClient, items: &[DecisionItem]) -> ColloquyResult<Value> {
    let listing = items
        .iter()
        .map(|item| format!("- [{}] {}", item.item_type, item.summary))
        .collect::<Vec<_>>()
        .join("\n");
    let messages = json!([
        {"role": "system", "content":
            "You summarize meeting intelligence items. Respond with JSON only, exactly \
             {\"lede\": \"...\", \"theme\": \"...\"}. The lede is one sentence capturing the \
             most important outcome; the theme is a 2-4 word topic label."},
        {"role": "user", "content": format!("Captured items:\n{listing}")},
    ]);
    let response = llm.chat(messages, None, None, 0.2, 120).await?;
    let content = LlmClient::first_content(&response)
        .ok_or_else(|| ColloquyError::Llm("summary response had no content".into()))?;
    // Models occasionally wrap JSON in a code fence.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed).map_err(|e| ColloquyError::Llm(format!("bad summary JSON: {e}")))
}

/// Runs the decision listener until the token is cancelled.
pub async fn run(
    cfg: DecisionConfig,
    llm_cfg: LlmConfig,
    tracker: Arc<TrackerStore>,
    cancel: CancellationToken,
) -> ColloquyResult<()> {
    let client = redis::Client::open(cfg.redis_url.as_str())?;
    let conn = ConnectionManager::new(client).await?;

    let llm = LlmClient::new(&llm_cfg)?;
    let log = DecisionLog::new(conn, cfg.decisions_ttl_secs);
    let engine = Arc::new(DecisionEngine::new(
        cfg.clone(),
        log.clone(),
        llm.clone(),
        Arc::clone(&tracker),
    ));

    let listener = tokio::spawn(listener::run_listener(
        Arc::clone(&engine),
        cfg.redis_url.clone(),
        cancel.clone(),
    ));

    let state = DecisionHttpState {
        engine,
        log,
        llm,
        tracker,
    };
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let http_listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ColloquyError::Configuration(format!("decision HTTP bind failed: {e}")))?;
    log::info!("[Decisions] HTTP surface on http://{addr}");

    let shutdown = cancel.clone();
    axum::serve(http_listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ColloquyError::Internal(format!("decision server error: {e}")))?;

    let _ = listener.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_item_wire_shape_uses_type_key() {
        let item = DecisionItem {
            item_type: "decision".into(),
            summary: "Ship Friday".into(),
            speaker: Some("Ann".into()),
            confidence: 0.9,
            entities: vec![Entity {
                entity_type: "person".into(),
                label: "Ann".into(),
                id: "ann".into(),
            }],
            meeting_id: Some("42".into()),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "decision");
        assert_eq!(value["entities"][0]["type"], "person");
        assert_eq!(value["meeting_id"], "42");
    }

    #[test]
    fn tool_call_args_deserialize_with_null_speaker() {
        let item: DecisionItem = serde_json::from_str(
            r#"{"type":"no_match","summary":"","speaker":null,"confidence":0.0,"entities":[]}"#,
        )
        .unwrap();
        assert_eq!(item.item_type, "no_match");
        assert!(item.speaker.is_none());
        assert!(item.meeting_id.is_none());
    }
}
