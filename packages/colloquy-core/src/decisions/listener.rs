//! Pub/sub listener feeding the decision engine.
//!
//! Pattern-subscribes to every meeting's mutable channel. Each message is
//! handed to the engine on its own task so a slow LLM pass never stalls the
//! subscription; the loop reconnects with a backoff after any Redis error.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::window::DecisionEngine;
use crate::limits;
use crate::segment::Segment;

/// `tc:meeting:42:mutable` → `42`; unknown shapes fall back to the whole
/// channel name so they at least group consistently.
fn extract_meeting_id(channel: &str) -> &str {
    let parts: Vec<&str> = channel.split(':').collect();
    if parts.len() == 4 {
        parts[2]
    } else {
        channel
    }
}

/// Runs the subscription loop until cancelled.
pub async fn run_listener(
    engine: Arc<DecisionEngine>,
    redis_url: String,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match listen_once(&engine, &redis_url, &cancel).await {
            Ok(()) => return,
            Err(e) => {
                log::error!(
                    "[Decisions] Pub/sub loop error: {e}. Reconnecting in {}s",
                    limits::TASK_RESTART_BACKOFF_SECS
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(
                        limits::TASK_RESTART_BACKOFF_SECS,
                    )) => {}
                }
            }
        }
    }
}

async fn listen_once(
    engine: &Arc<DecisionEngine>,
    redis_url: &str,
    cancel: &CancellationToken,
) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(limits::MUTABLE_CHANNEL_PATTERN).await?;
    log::info!(
        "[Decisions] Subscribed to pattern {}",
        limits::MUTABLE_CHANNEL_PATTERN
    );

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = messages.next() => {
                let Some(message) = message else {
                    return Err(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "pub/sub stream ended",
                    )));
                };
                let meeting_id = extract_meeting_id(message.get_channel_name()).to_string();
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("[Decisions] Unreadable pub/sub payload: {e}");
                        continue;
                    }
                };
                match parse_segments(&payload) {
                    Some(segments) if !segments.is_empty() => {
                        let engine = Arc::clone(engine);
                        tokio::spawn(async move {
                            engine.handle_update(&meeting_id, segments).await;
                        });
                    }
                    Some(_) => {}
                    None => log::error!(
                        "[Decisions] Failed to parse message on meeting {meeting_id}"
                    ),
                }
            }
        }
    }
}

/// Pulls `payload.segments` out of a `segments_updated` message.
fn parse_segments(payload: &str) -> Option<Vec<Segment>> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    serde_json::from_value(value.get("payload")?.get("segments")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meeting_id_is_extracted_from_channel() {
        assert_eq!(extract_meeting_id("tc:meeting:42:mutable"), "42");
        assert_eq!(extract_meeting_id("something-else"), "something-else");
    }

    #[test]
    fn segments_are_parsed_from_snapshot_payload() {
        let payload = r#"{"event":"segments_updated","meeting_id":"42",
            "payload":{"segments":[{"start":0.0,"end":4.0,"text":"hello world.","completed":true}]}}"#;
        let segments = parse_segments(payload).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello world.");
    }

    #[test]
    fn malformed_payload_is_rejected_not_panicked() {
        assert!(parse_segments("not json").is_none());
        assert!(parse_segments(r#"{"payload":{}}"#).is_none());
    }
}
