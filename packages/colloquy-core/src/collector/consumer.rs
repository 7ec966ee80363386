//! Consumer-group reader for the outbound segment stream.
//!
//! At-least-once semantics: entries are acknowledged only after they have
//! been merged into the session map. Entries stuck in another consumer's
//! PEL are claimed at startup and on a periodic sweep. Unparseable entries
//! are acked and logged so one poison pill cannot wedge the group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use super::merge::SessionStore;
use super::publisher::MutablePublisher;
use crate::config::CollectorConfig;
use crate::error::ColloquyResult;
use crate::limits;
use crate::wire::StreamEnvelope;

pub struct StreamConsumer {
    cfg: CollectorConfig,
    conn: ConnectionManager,
    store: Arc<SessionStore>,
    publisher: MutablePublisher,
}

impl StreamConsumer {
    pub fn new(
        cfg: CollectorConfig,
        conn: ConnectionManager,
        store: Arc<SessionStore>,
        publisher: MutablePublisher,
    ) -> Self {
        Self {
            cfg,
            conn,
            store,
            publisher,
        }
    }

    /// Creates the consumer group, tolerating an existing one.
    pub async fn ensure_group(&self) -> ColloquyResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.cfg.stream_name, &self.cfg.consumer_group, "0")
            .await;
        match result {
            Ok(_) => {
                log::info!(
                    "[Collector] Created consumer group '{}' on '{}'",
                    self.cfg.consumer_group,
                    self.cfg.stream_name
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs the read loop until cancelled. In-flight entries are finished
    /// and acked before the loop returns.
    pub async fn run(&self, cancel: CancellationToken) -> ColloquyResult<()> {
        self.ensure_group().await?;
        self.claim_stale().await?;
        let mut last_sweep = Instant::now();

        loop {
            if cancel.is_cancelled() {
                log::info!("[Collector] Consumer stopping");
                return Ok(());
            }

            if last_sweep.elapsed() >= Duration::from_secs(limits::CLAIM_SWEEP_INTERVAL_SECS) {
                if let Err(e) = self.claim_stale().await {
                    log::warn!("[Collector] Stale-claim sweep failed: {e}");
                }
                last_sweep = Instant::now();
            }

            let options = StreamReadOptions::default()
                .group(&self.cfg.consumer_group, &self.cfg.consumer_name)
                .count(self.cfg.read_count)
                .block(self.cfg.block_ms as usize);
            let mut conn = self.conn.clone();
            // A blocking read that times out yields Nil, not an empty reply.
            let stream_names = [&self.cfg.stream_name];
            let reply: Option<StreamReadReply> = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                reply = conn.xread_options(&stream_names, &[">"], &options) => reply?,
            };
            let Some(reply) = reply else { continue };

            for key in reply.keys {
                for entry in key.ids {
                    self.handle_entry(&entry).await;
                }
            }
        }
    }

    /// Processes one stream entry and acks it exactly once.
    async fn handle_entry(&self, entry: &StreamId) {
        let Some(payload) = entry.get::<String>("payload") else {
            log::error!(
                "[Collector] Entry {} has no payload field, acking as poison",
                entry.id
            );
            self.ack(&entry.id).await;
            return;
        };

        match serde_json::from_str::<StreamEnvelope>(&payload) {
            Ok(envelope) => {
                self.process(envelope).await;
                self.ack(&entry.id).await;
            }
            Err(e) => {
                // Deterministic failure: retrying cannot help, drop it.
                log::error!("[Collector] Poison entry {} dropped: {e}", entry.id);
                self.ack(&entry.id).await;
            }
        }
    }

    async fn process(&self, envelope: StreamEnvelope) {
        match envelope {
            StreamEnvelope::SessionStart {
                uid,
                token,
                platform,
                meeting_id,
                start_timestamp,
            } => {
                let started_at = start_timestamp
                    .parse()
                    .unwrap_or_else(|_| chrono::Utc::now());
                self.store
                    .open(&uid, &meeting_id, &token, &platform, started_at);
                log::info!(
                    "[Collector] Session {} started for meeting {} ({})",
                    uid,
                    meeting_id,
                    platform
                );
            }
            StreamEnvelope::Transcription {
                uid,
                token,
                platform,
                meeting_id,
                segments,
                ..
            } => {
                // Tolerate a lost session_start: open the session on first
                // sight so segments are never dropped.
                let session = self.store.get(&uid).unwrap_or_else(|| {
                    self.store
                        .open(&uid, &meeting_id, &token, &platform, chrono::Utc::now())
                });
                let changed = {
                    let mut buffer = session.lock();
                    buffer.merge(&segments)
                };
                if changed {
                    let snapshot = self
                        .store
                        .meeting_snapshot(&meeting_id, self.cfg.snapshot_segments);
                    self.publisher.segments_updated(&meeting_id, &snapshot).await;
                }
            }
            StreamEnvelope::SessionEnd { uid, .. } => {
                self.store.mark_ended(&uid);
                log::info!("[Collector] Session {} ended", uid);
            }
        }
    }

    async fn ack(&self, id: &str) {
        let mut conn = self.conn.clone();
        let result: Result<i64, redis::RedisError> = conn
            .xack(&self.cfg.stream_name, &self.cfg.consumer_group, &[id])
            .await;
        if let Err(e) = result {
            log::warn!("[Collector] Failed to ack {id}: {e}");
        }
    }

    /// Claims entries idle beyond the pending timeout and processes them.
    async fn claim_stale(&self) -> ColloquyResult<()> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.cfg.stream_name,
                &self.cfg.consumer_group,
                "-",
                "+",
                100usize,
            )
            .await?;

        let stale: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= self.cfg.pending_msg_timeout_ms as usize)
            .map(|p| p.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        log::info!(
            "[Collector] Claiming {} stale entries for {}",
            stale.len(),
            self.cfg.consumer_name
        );
        let claimed: redis::streams::StreamClaimReply = conn
            .xclaim(
                &self.cfg.stream_name,
                &self.cfg.consumer_group,
                &self.cfg.consumer_name,
                self.cfg.pending_msg_timeout_ms as usize,
                &stale,
            )
            .await?;

        for entry in &claimed.ids {
            self.handle_entry(entry).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("stream", &self.cfg.stream_name)
            .field("group", &self.cfg.consumer_group)
            .field("consumer", &self.cfg.consumer_name)
            .finish()
    }
}
