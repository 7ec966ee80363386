//! Durable segment store over Postgres.
//!
//! Rows are keyed `(session_uid, start_time)`. Writes are at-least-once:
//! the upsert tolerates replays by leaving the stored row intact on a key
//! conflict, so re-promoting the same segment is a no-op.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::ColloquyResult;
use crate::segment::Segment;

/// A persisted transcript row.
#[derive(Debug, Clone)]
pub struct StoredSegment {
    pub session_uid: String,
    pub meeting_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub language: Option<String>,
    pub speaker_id: Option<String>,
    pub speaker_name: Option<String>,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SegmentStore {
    pool: PgPool,
}

impl SegmentStore {
    pub async fn connect(database_url: &str) -> ColloquyResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the segments table when it does not exist yet. Schema
    /// migrations proper live outside this service; this only covers a
    /// fresh development database.
    pub async fn ensure_schema(&self) -> ColloquyResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transcription_segments (
                session_uid   TEXT NOT NULL,
                meeting_id    TEXT NOT NULL,
                start_time    DOUBLE PRECISION NOT NULL,
                end_time      DOUBLE PRECISION NOT NULL,
                text          TEXT NOT NULL,
                language      TEXT,
                speaker_id    TEXT,
                speaker_name  TEXT,
                confidence    REAL NOT NULL DEFAULT 0,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (session_uid, start_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_segments_meeting_time \
             ON transcription_segments (meeting_id, start_time)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts promoted segments in one transaction. Returns the number of
    /// rows actually written; conflicts leave the stored row intact.
    pub async fn upsert_batch(
        &self,
        session_uid: &str,
        meeting_id: &str,
        segments: &[Segment],
    ) -> ColloquyResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for seg in segments {
            let result = sqlx::query(
                r#"
                INSERT INTO transcription_segments
                    (session_uid, meeting_id, start_time, end_time, text,
                     language, speaker_id, speaker_name, confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (session_uid, start_time) DO NOTHING
                "#,
            )
            .bind(session_uid)
            .bind(meeting_id)
            .bind(seg.start)
            .bind(seg.end)
            .bind(seg.text.as_str())
            .bind(seg.language.as_deref())
            .bind(seg.speaker_id.as_deref())
            .bind(seg.speaker_name.as_deref())
            .bind(seg.confidence)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Stored segments for a meeting, optionally bounded by a time range,
    /// ordered by start time.
    pub async fn segments_for_meeting(
        &self,
        meeting_id: &str,
        from_sec: Option<f64>,
        to_sec: Option<f64>,
    ) -> ColloquyResult<Vec<StoredSegment>> {
        let rows = sqlx::query(
            r#"
            SELECT session_uid, meeting_id, start_time, end_time, text,
                   language, speaker_id, speaker_name, confidence, created_at
            FROM transcription_segments
            WHERE meeting_id = $1
              AND ($2::double precision IS NULL OR start_time >= $2)
              AND ($3::double precision IS NULL OR start_time < $3)
            ORDER BY start_time
            "#,
        )
        .bind(meeting_id)
        .bind(from_sec)
        .bind(to_sec)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredSegment {
                session_uid: row.get("session_uid"),
                meeting_id: row.get("meeting_id"),
                start_time: row.get("start_time"),
                end_time: row.get("end_time"),
                text: row.get("text"),
                language: row.get("language"),
                speaker_id: row.get("speaker_id"),
                speaker_name: row.get("speaker_name"),
                confidence: row.get("confidence"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
