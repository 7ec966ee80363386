//! Relay from the gateway to the outbound segment stream.
//!
//! Every record is one stream entry with a single `payload` field holding the
//! JSON envelope; the stream is trimmed approximately on append so a dead
//! collector cannot grow it without bound.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;

use crate::error::ColloquyResult;
use crate::limits;
use crate::segment::Segment;
use crate::wire::StreamEnvelope;

#[derive(Clone)]
pub struct CollectorRelay {
    conn: ConnectionManager,
    stream: String,
}

impl CollectorRelay {
    pub async fn connect(redis_url: &str, stream: &str) -> ColloquyResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            stream: stream.to_string(),
        })
    }

    async fn publish(&self, envelope: &StreamEnvelope) -> ColloquyResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(limits::STREAM_MAXLEN),
                "*",
                &[("payload", payload)],
            )
            .await?;
        Ok(())
    }

    pub async fn session_start(
        &self,
        uid: &str,
        token: &str,
        platform: &str,
        meeting_id: &str,
        started_at: DateTime<Utc>,
    ) -> ColloquyResult<()> {
        self.publish(&StreamEnvelope::SessionStart {
            uid: uid.into(),
            token: token.into(),
            platform: platform.into(),
            meeting_id: meeting_id.into(),
            start_timestamp: started_at.to_rfc3339(),
        })
        .await
    }

    pub async fn transcription(
        &self,
        uid: &str,
        token: &str,
        platform: &str,
        meeting_id: &str,
        segments: Vec<Segment>,
        language: Option<String>,
    ) -> ColloquyResult<()> {
        if segments.is_empty() {
            return Ok(());
        }
        self.publish(&StreamEnvelope::Transcription {
            uid: uid.into(),
            token: token.into(),
            platform: platform.into(),
            meeting_id: meeting_id.into(),
            segments,
            language,
        })
        .await
    }

    pub async fn session_end(
        &self,
        uid: &str,
        token: &str,
        platform: &str,
        meeting_id: &str,
    ) -> ColloquyResult<()> {
        self.publish(&StreamEnvelope::SessionEnd {
            uid: uid.into(),
            token: token.into(),
            platform: platform.into(),
            meeting_id: meeting_id.into(),
        })
        .await
    }
}
