//! Time-based promotion of stable segments into the durable store.
//!
//! Runs on a fixed tick, independently of the stream consumer. Promotion is
//! capture-then-persist-then-drain: segments are copied out under the
//! session lock, written in one transaction with a conflict-tolerant
//! upsert, and only then removed from the map (skipping keys rewritten in
//! the meantime). A failed commit leaves everything in place for the next
//! tick.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::merge::SessionStore;
use super::publisher::MutablePublisher;
use crate::config::CollectorConfig;
use crate::error::ColloquyResult;
use crate::persist::SegmentStore;

pub struct Promoter {
    cfg: CollectorConfig,
    store: Arc<SessionStore>,
    segments: SegmentStore,
    publisher: MutablePublisher,
}

impl Promoter {
    pub fn new(
        cfg: CollectorConfig,
        store: Arc<SessionStore>,
        segments: SegmentStore,
        publisher: MutablePublisher,
    ) -> Self {
        Self {
            cfg,
            store,
            segments,
            publisher,
        }
    }

    /// Runs promotion ticks until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> ColloquyResult<()> {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.cfg.background_task_interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[Promoter] Stopping");
                    return Ok(());
                }
                _ = tick.tick() => self.sweep().await,
            }
        }
    }

    /// One promotion pass over every live session.
    async fn sweep(&self) {
        for session in self.store.all() {
            let (session_uid, meeting_id, promoted, ended) = {
                let buffer = session.lock();
                (
                    buffer.session_uid.clone(),
                    buffer.meeting_id.clone(),
                    buffer.promotable(self.cfg.immutability_threshold_secs),
                    buffer.ended,
                )
            };

            if !promoted.is_empty() {
                let rows: Vec<_> = promoted.iter().map(|(_, _, seg)| seg.clone()).collect();
                match self
                    .segments
                    .upsert_batch(&session_uid, &meeting_id, &rows)
                    .await
                {
                    Ok(inserted) => {
                        log::info!(
                            "[Promoter] {}: promoted {} segments ({} new rows)",
                            session_uid,
                            promoted.len(),
                            inserted
                        );
                        session.lock().drain(&promoted);
                        let snapshot = self
                            .store
                            .meeting_snapshot(&meeting_id, self.cfg.snapshot_segments);
                        self.publisher.segments_updated(&meeting_id, &snapshot).await;
                    }
                    Err(e) => {
                        // Map left intact; the next tick retries.
                        log::error!(
                            "[Promoter] {}: commit failed, will retry: {}",
                            session_uid,
                            e
                        );
                    }
                }
            }

            // A finished session disappears once its map is drained.
            if ended && session.lock().segments.is_empty() {
                self.store.remove(&session_uid);
                log::info!("[Promoter] {}: session drained and closed", session_uid);
            }
        }
    }
}
