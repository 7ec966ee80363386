//! Best-effort pub/sub emission of mutable-segment snapshots.
//!
//! Publishing failures are swallowed after a warning: subscribers can always
//! recover from the durable store, and the collector must keep consuming
//! whether or not anyone is listening.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::limits::mutable_channel;
use crate::segment::Segment;

#[derive(Clone)]
pub struct MutablePublisher {
    conn: ConnectionManager,
}

impl MutablePublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Publishes the current snapshot for a meeting on its mutable channel.
    pub async fn segments_updated(&self, meeting_id: &str, segments: &[Segment]) {
        let payload = serde_json::json!({
            "event": "segments_updated",
            "meeting_id": meeting_id,
            "payload": { "segments": segments },
        });
        let mut conn = self.conn.clone();
        let result: Result<i64, redis::RedisError> = conn
            .publish(mutable_channel(meeting_id), payload.to_string())
            .await;
        if let Err(e) = result {
            log::warn!("[Collector] Pub/sub emit failed for meeting {meeting_id}: {e}");
        }
    }
}
