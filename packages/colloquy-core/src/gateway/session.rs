//! Per-connection session state and the ASR worker loop.
//!
//! The WebSocket read loop pushes PCM and control frames into the session
//! without ever blocking on inference; a dedicated worker task drains the
//! rolling buffer, runs the backend, stabilises hypotheses, attributes
//! speakers, and fans results out to the bot and the outbound stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::asr::{AsrError, Transcriber};
use crate::audio::{chunk_is_silent, EnergyVad, RollingBuffer};
use crate::gateway::outbound::CollectorRelay;
use crate::limits;
use crate::segment::{Segment, SegmentStabilizer};
use crate::speaker::{SpeakerActivityEntry, SpeakerMatcher};
use crate::wire::{ServerMessage, SessionConfig, SpeakerActivityPayload};

/// State owned by one bot connection.
pub struct Session {
    pub uid: String,
    pub meeting_id: String,
    pub platform: String,
    pub token: String,
    pub task: String,
    pub initial_prompt: Option<String>,
    pub use_vad: bool,
    pub started_at: DateTime<Utc>,

    language: Mutex<Option<String>>,
    buffer: Mutex<RollingBuffer>,
    vad: Mutex<EnergyVad>,
    stabilizer: Mutex<SegmentStabilizer>,
    /// Committed finals, oldest first, capped to a bounded history.
    transcript: Mutex<Vec<Segment>>,
    speaker_activity: Mutex<Vec<SpeakerActivityEntry>>,
    matcher: SpeakerMatcher,

    /// Serialized JSON frames headed for the bot.
    outbound: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(config: &SessionConfig, outbound: mpsc::Sender<String>) -> Arc<Self> {
        let started_at = Utc::now();
        Arc::new(Self {
            uid: config.uid.clone(),
            meeting_id: config.meeting_id.clone(),
            platform: config.platform.clone(),
            token: config.token.clone(),
            task: config.task.clone(),
            initial_prompt: config.initial_prompt.clone(),
            use_vad: config.use_vad,
            started_at,
            language: Mutex::new(config.language.clone()),
            buffer: Mutex::new(RollingBuffer::new(limits::SAMPLE_RATE)),
            vad: Mutex::new(EnergyVad::new(limits::SAMPLE_RATE)),
            stabilizer: Mutex::new(SegmentStabilizer::default()),
            transcript: Mutex::new(Vec::new()),
            speaker_activity: Mutex::new(Vec::new()),
            matcher: SpeakerMatcher::new(started_at),
            outbound,
            cancel: CancellationToken::new(),
        })
    }

    /// Appends decoded PCM from a binary frame.
    pub fn push_audio(&self, frames: &[f32]) {
        if frames.is_empty() {
            return;
        }
        self.buffer.lock().append(frames);
        if self.use_vad {
            self.vad.lock().push(frames);
        }
    }

    /// Records a `speaker_activity_update` payload. Entries with an invalid
    /// timestamp are skipped (logged once per message).
    pub fn record_speaker_activity(&self, timestamp: &str, speakers: &[SpeakerActivityPayload]) {
        let Ok(ts) = timestamp.parse::<DateTime<Utc>>() else {
            log::warn!(
                "[WS] client {} sent speaker update with bad timestamp {:?}",
                self.uid,
                timestamp
            );
            return;
        };
        let mut activity = self.speaker_activity.lock();
        for speaker in speakers {
            if speaker.mic_activity_bits.is_empty() {
                continue;
            }
            activity.push(SpeakerActivityEntry {
                user_id: speaker.id.clone(),
                name: speaker.name.clone(),
                timestamp: ts,
                meta_bits: speaker.mic_activity_bits.clone(),
            });
        }
    }

    pub async fn send_to_client(&self, message: ServerMessage) {
        let _ = self.outbound.send(message.to_json()).await;
    }

    /// Builds the update for this pass: the trailing slice of committed
    /// finals plus the live partial, speaker-attributed against a snapshot
    /// of the activity list.
    fn prepare_update(&self, finals: Vec<Segment>, partial: Option<Segment>) -> Vec<Segment> {
        let mut transcript = self.transcript.lock();
        transcript.extend(finals);
        let excess = transcript
            .len()
            .saturating_sub(limits::TRANSCRIPT_HISTORY_SEGMENTS);
        if excess > 0 {
            transcript.drain(..excess);
        }

        let tail_start = transcript
            .len()
            .saturating_sub(limits::SEND_LAST_N_SEGMENTS);
        let mut update: Vec<Segment> = transcript[tail_start..].to_vec();
        drop(transcript);

        update.extend(partial);

        let snapshot = self.speaker_activity.lock().clone();
        self.matcher.assign(&snapshot, &mut update);
        update
    }

    /// Dedicated ASR loop for this connection.
    ///
    /// Runs until cancelled. Overload from the backend skips the pass
    /// without advancing offsets; other failures back off briefly and the
    /// loop keeps the session alive.
    pub async fn asr_worker(self: Arc<Self>, transcriber: Arc<dyn Transcriber>, relay: CollectorRelay) {
        let min_chunk = transcriber.min_chunk_secs();
        log::info!(
            "[ASR] worker started for {} (backend={}, min_chunk={}s)",
            self.uid,
            transcriber.name(),
            min_chunk
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let (chunk, duration, offset) = {
                let mut buffer = self.buffer.lock();
                if buffer.clip_if_stalled() {
                    log::warn!(
                        "[ASR] {} stalled, window forced to last {}s",
                        self.uid,
                        limits::STALL_KEEP_SECS
                    );
                }
                let (chunk, duration) = buffer.next_chunk();
                (chunk, duration, buffer.timestamp_offset_sec())
            };

            if duration < min_chunk {
                self.idle(Duration::from_millis(100)).await;
                continue;
            }

            // After end-of-utterance, a silent tail is consumed without an
            // ASR pass; audio keeps accumulating either way.
            if self.use_vad && self.vad.lock().take_end_of_utterance() && chunk_is_silent(&chunk) {
                self.buffer.lock().advance(duration);
                continue;
            }

            let language = self.language.lock().clone();
            let result = transcriber
                .transcribe(
                    &chunk,
                    language.as_deref(),
                    &self.task,
                    self.initial_prompt.as_deref(),
                )
                .await;

            match result {
                Err(AsrError::Overloaded {
                    retry_after_sec,
                    status,
                }) => {
                    // Re-buffer: offsets untouched, this pass is skipped.
                    log::warn!(
                        "[ASR] {} backend overloaded (status {}), retrying in {:.1}s",
                        self.uid,
                        status,
                        retry_after_sec
                    );
                    self.idle(Duration::from_secs_f64(retry_after_sec.max(1.0)))
                        .await;
                }
                Err(err) => {
                    log::error!("[ASR] {} pass failed: {}", self.uid, err);
                    self.idle(Duration::from_millis(250)).await;
                }
                Ok((segments, info)) => {
                    self.maybe_adopt_language(&info.language, info.language_probability)
                        .await;

                    if segments.is_empty() {
                        // No speech in the chunk; consume it so silence is
                        // not re-decoded forever.
                        self.buffer.lock().advance(duration);
                        self.idle(Duration::from_millis(100)).await;
                        continue;
                    }

                    let outcome = self.stabilizer.lock().ingest(offset, duration, &segments);
                    if let Some(advance) = outcome.advance_sec {
                        self.buffer.lock().advance(advance);
                    }

                    let update = self.prepare_update(outcome.finals, outcome.partial);
                    if update.is_empty() {
                        continue;
                    }

                    self.send_to_client(ServerMessage::Segments {
                        uid: self.uid.clone(),
                        segments: update.clone(),
                    })
                    .await;

                    let language = self.language.lock().clone();
                    if let Err(e) = relay
                        .transcription(
                            &self.uid,
                            &self.token,
                            &self.platform,
                            &self.meeting_id,
                            update,
                            language,
                        )
                        .await
                    {
                        log::error!("[ASR] {} failed to relay segments: {}", self.uid, e);
                    }
                }
            }
        }

        log::info!("[ASR] worker stopped for {}", self.uid);
    }

    /// Adopts the detected language once, and tells the bot about it.
    async fn maybe_adopt_language(&self, detected: &Option<String>, probability: f32) {
        let Some(detected) = detected else { return };
        {
            let mut language = self.language.lock();
            if language.is_some() || probability <= 0.5 {
                return;
            }
            *language = Some(detected.clone());
        }
        log::info!(
            "[ASR] {} detected language {} (p={:.2})",
            self.uid,
            detected,
            probability
        );
        self.send_to_client(ServerMessage::Language {
            uid: self.uid.clone(),
            language: detected.clone(),
            language_prob: probability,
        })
        .await;
    }

    /// Sleeps unless the session is cancelled first.
    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        serde_json::from_str(
            r#"{"uid":"s1","platform":"gm","meeting_id":42,"token":"T"}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn update_includes_history_tail_and_partial() {
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new(&config(), tx);
        let finals: Vec<Segment> = (0..15)
            .map(|i| Segment::new(i as f64, i as f64 + 1.0, "seg", true))
            .collect();
        let partial = Some(Segment::new(15.0, 15.5, "tail", false));
        let update = session.prepare_update(finals, partial);
        assert_eq!(update.len(), limits::SEND_LAST_N_SEGMENTS + 1);
        assert!(!update.last().unwrap().completed);
    }

    #[tokio::test]
    async fn bad_speaker_timestamp_is_dropped() {
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new(&config(), tx);
        session.record_speaker_activity(
            "not-a-timestamp",
            &[SpeakerActivityPayload {
                id: "7".into(),
                name: "Ann".into(),
                mic_activity_bits: "111".into(),
            }],
        );
        assert!(session.speaker_activity.lock().is_empty());
    }

    #[tokio::test]
    async fn audio_accumulates_into_the_buffer() {
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new(&config(), tx);
        session.push_audio(&vec![0.25; limits::SAMPLE_RATE as usize]);
        let (chunk, duration) = session.buffer.lock().next_chunk();
        assert_eq!(chunk.len(), limits::SAMPLE_RATE as usize);
        assert!((duration - 1.0).abs() < 1e-6);
    }
}
