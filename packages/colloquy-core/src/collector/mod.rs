//! Transcription collector: stream consumer, merge engine, and promoter.
//!
//! The consumer writes into per-session maps; the promoter reads them on a
//! tick. Neither awaits the other: coordination is only the per-session
//! lock held for short, non-suspending critical sections.

mod consumer;
mod merge;
mod promoter;
mod publisher;

pub use consumer::StreamConsumer;
pub use merge::{MutableSegment, SessionBuffer, SessionStore};
pub use promoter::Promoter;
pub use publisher::MutablePublisher;

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;

use crate::config::CollectorConfig;
use crate::error::ColloquyResult;
use crate::limits;
use crate::persist::SegmentStore;

/// Runs the collector until the token is cancelled.
///
/// Both loops self-restart with a backoff on error, so a Redis or database
/// hiccup degrades the collector instead of killing it.
pub async fn run(cfg: CollectorConfig, cancel: CancellationToken) -> ColloquyResult<()> {
    let client = redis::Client::open(cfg.redis_url.as_str())?;
    let conn = ConnectionManager::new(client).await?;

    let segment_store = SegmentStore::connect(&cfg.database_url).await?;
    segment_store.ensure_schema().await?;

    let store = Arc::new(SessionStore::new());
    let publisher = MutablePublisher::new(conn.clone());

    let promoter = Promoter::new(
        cfg.clone(),
        Arc::clone(&store),
        segment_store,
        publisher.clone(),
    );
    let promoter_cancel = cancel.clone();
    let promoter_task = tokio::spawn(async move {
        loop {
            match promoter.run(promoter_cancel.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    log::error!("[Promoter] Loop error, restarting: {e}");
                    tokio::select! {
                        _ = promoter_cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(
                            limits::TASK_RESTART_BACKOFF_SECS,
                        )) => {}
                    }
                }
            }
        }
    });

    let consumer = StreamConsumer::new(cfg, conn, store, publisher);
    loop {
        match consumer.run(cancel.clone()).await {
            Ok(()) => break,
            Err(e) => {
                log::error!("[Collector] Consumer loop error, restarting: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(
                        limits::TASK_RESTART_BACKOFF_SECS,
                    )) => {}
                }
            }
        }
    }

    let _ = promoter_task.await;
    Ok(())
}
