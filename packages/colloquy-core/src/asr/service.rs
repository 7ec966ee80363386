//! Serving side of the remote-HTTP backend: an OpenAI-compatible
//! `/v1/audio/transcriptions` endpoint fronting the configured backend,
//! gated by load admission.
//!
//! Admission is fail-fast by default: a semaphore caps in-flight passes and
//! a bounded queue caps waiters; beyond that the service answers 503 with a
//! `Retry-After` hint instead of building an unbounded backlog. Gateways
//! treat that response as `Overloaded` and re-buffer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use super::Transcriber;
use crate::error::{ColloquyError, ColloquyResult};

/// Settings for the transcriber service role.
#[derive(Debug, Clone)]
pub struct TranscriberServiceConfig {
    pub port: u16,
    pub max_concurrent: usize,
    pub max_queue: usize,
    /// When true, saturation answers 503 immediately instead of queueing.
    pub fail_fast_when_busy: bool,
    /// `Retry-After` seconds reported on a busy refusal.
    pub busy_retry_after_s: u64,
    pub api_token: Option<String>,
}

impl Default for TranscriberServiceConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            max_concurrent: 2,
            max_queue: 4,
            fail_fast_when_busy: true,
            busy_retry_after_s: 2,
            api_token: None,
        }
    }
}

/// Caps concurrent transcriptions plus the waiters behind them.
pub struct AdmissionGate {
    slots: Semaphore,
    waiting: AtomicUsize,
    max_queue: usize,
    fail_fast: bool,
}

/// Refusal issued when the gate is saturated.
#[derive(Debug, PartialEq, Eq)]
pub struct Busy {
    pub retry_after_s: u64,
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize, max_queue: usize, fail_fast: bool) -> Self {
        Self {
            slots: Semaphore::new(max_concurrent.max(1)),
            waiting: AtomicUsize::new(0),
            max_queue,
            fail_fast,
        }
    }

    /// Acquires a slot, or refuses with a retry hint.
    pub async fn acquire(&self, retry_after_s: u64) -> Result<SemaphorePermit<'_>, Busy> {
        if let Ok(permit) = self.slots.try_acquire() {
            return Ok(permit);
        }
        if self.fail_fast {
            return Err(Busy { retry_after_s });
        }

        // Queued mode still bounds the backlog.
        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel);
        if waiting >= self.max_queue {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            return Err(Busy { retry_after_s });
        }
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| Busy { retry_after_s });
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        permit
    }
}

#[derive(Clone)]
pub struct TranscriberServiceState {
    config: Arc<TranscriberServiceConfig>,
    gate: Arc<AdmissionGate>,
    transcriber: Arc<dyn Transcriber>,
}

pub fn router(config: TranscriberServiceConfig, transcriber: Arc<dyn Transcriber>) -> Router {
    let gate = Arc::new(AdmissionGate::new(
        config.max_concurrent,
        config.max_queue,
        config.fail_fast_when_busy,
    ));
    let state = TranscriberServiceState {
        config: Arc::new(config),
        gate,
        transcriber,
    };
    Router::new()
        .route("/health", get(health))
        .route("/v1/audio/transcriptions", post(transcribe))
        // WAV uploads for a 45 s window are a few MB; allow headroom.
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn transcribe(
    State(state): State<TranscriberServiceState>,
    headers: axum::http::HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Some(expected) = &state.config.api_token {
        if !token_matches(&headers, expected) {
            return (StatusCode::UNAUTHORIZED, "invalid or missing API token").into_response();
        }
    }

    let permit = match state.gate.acquire(state.config.busy_retry_after_s).await {
        Ok(permit) => permit,
        Err(busy) => {
            log::warn!("[Transcriber] Saturated, refusing with Retry-After {}", busy.retry_after_s);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [("Retry-After", busy.retry_after_s.to_string())],
                "transcriber overloaded",
            )
                .into_response();
        }
    };

    let mut audio: Option<Vec<f32>> = None;
    let mut language: Option<String> = None;
    let mut task = "transcribe".to_string();
    let mut prompt: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("bad multipart body: {e}"))
                    .into_response()
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => match field.bytes().await {
                Ok(bytes) => match decode_wav_mono16(&bytes) {
                    Ok(samples) => audio = Some(samples),
                    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
                },
                Err(e) => {
                    return (StatusCode::BAD_REQUEST, format!("file read: {e}")).into_response()
                }
            },
            "language" => language = field.text().await.ok().filter(|s| !s.is_empty()),
            "task" => {
                if let Ok(value) = field.text().await {
                    task = value;
                }
            }
            "prompt" => prompt = field.text().await.ok().filter(|s| !s.is_empty()),
            // model/response_format are accepted and ignored; the backend
            // is fixed per process.
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let Some(audio) = audio else {
        return (StatusCode::BAD_REQUEST, "missing file field").into_response();
    };

    let result = state
        .transcriber
        .transcribe(&audio, language.as_deref(), &task, prompt.as_deref())
        .await;
    drop(permit);

    match result {
        Ok((segments, info)) => {
            let body = serde_json::json!({
                "language": info.language,
                "language_probability": info.language_probability,
                "duration": info.duration_sec,
                "text": segments.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join(" "),
                "segments": segments.iter().map(|s| serde_json::json!({
                    "start": s.start,
                    "end": s.end,
                    "text": s.text,
                    "no_speech_prob": s.no_speech_prob,
                    "avg_logprob": s.avg_logprob,
                    "compression_ratio": s.compression_ratio,
                })).collect::<Vec<_>>(),
            });
            Json(body).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn token_matches(headers: &axum::http::HeaderMap, expected: &str) -> bool {
    if let Some(key) = headers.get("X-API-Key").and_then(|v| v.to_str().ok()) {
        if key == expected {
            return true;
        }
    }
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token.trim() == expected)
        .unwrap_or(false)
}

/// Decodes a 16-bit mono PCM WAV into Float32 samples.
fn decode_wav_mono16(bytes: &[u8]) -> ColloquyResult<Vec<f32>> {
    if bytes.len() < 44 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(ColloquyError::InvalidRequest("not a WAV file".into()));
    }
    // Walk chunks to find `data`; the fmt chunk is not always 16 bytes.
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body = pos + 8;
        if id == b"data" {
            let end = (body + len).min(bytes.len());
            let samples = bytes[body..end]
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                .collect();
            return Ok(samples);
        }
        pos = body + len + (len & 1);
    }
    Err(ColloquyError::InvalidRequest("WAV has no data chunk".into()))
}

/// Runs the transcriber service until cancelled.
pub async fn run(
    config: TranscriberServiceConfig,
    transcriber: Arc<dyn Transcriber>,
    cancel: CancellationToken,
) -> ColloquyResult<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ColloquyError::Configuration(format!("transcriber bind failed: {e}")))?;
    log::info!("[Transcriber] Service on http://{addr}");
    axum::serve(listener, router(config, transcriber))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ColloquyError::Internal(format!("transcriber server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::wav_bytes;

    #[tokio::test]
    async fn gate_fails_fast_when_saturated() {
        let gate = AdmissionGate::new(1, 0, true);
        let held = gate.acquire(2).await.unwrap();
        let refused = gate.acquire(2).await.unwrap_err();
        assert_eq!(refused, Busy { retry_after_s: 2 });
        drop(held);
        assert!(gate.acquire(2).await.is_ok());
    }

    #[tokio::test]
    async fn queued_mode_bounds_the_backlog() {
        let gate = Arc::new(AdmissionGate::new(1, 1, false));
        let held = gate.acquire(1).await.unwrap();

        // One waiter fits in the queue...
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(1).await.is_ok() })
        };
        tokio::task::yield_now().await;
        // ...the next is refused.
        assert!(gate.acquire(1).await.is_err());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn wav_round_trip_recovers_samples() {
        let original = vec![0.0f32, 0.5, -0.5, 0.25];
        let wav = wav_bytes(&original, 16_000);
        let decoded = decode_wav_mono16(&wav).unwrap();
        assert_eq!(decoded.len(), original.len());
        for (a, b) in decoded.iter().zip(&original) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn non_wav_bodies_are_rejected() {
        assert!(decode_wav_mono16(b"definitely not audio").is_err());
    }
}
