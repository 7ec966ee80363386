//! Batch-style remote transcriber over an OpenAI-compatible HTTP API.
//!
//! Each pass uploads the chunk as a 16-bit WAV and asks for `verbose_json`.
//! A 429/503 (or an overload marker in the body) is surfaced as
//! [`AsrError::Overloaded`] immediately so the session can re-buffer without
//! advancing offsets; other transient failures are retried with exponential
//! backoff before giving up.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;

use super::{wav_bytes, AsrError, AsrInfo, AsrSegment, Transcriber};
use crate::limits;

pub struct RemoteHttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Deserialize)]
struct VerboseResponse {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    language_probability: Option<f32>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    #[serde(default)]
    text: String,
    #[serde(default)]
    no_speech_prob: f32,
    #[serde(default)]
    avg_logprob: f32,
    #[serde(default = "default_compression_ratio")]
    compression_ratio: f32,
}

fn default_compression_ratio() -> f32 {
    1.0
}

impl RemoteHttpTranscriber {
    pub fn new(endpoint: String, api_key: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    fn form(
        &self,
        pcm: &[f32],
        language: Option<&str>,
        task: &str,
        prompt: Option<&str>,
    ) -> Form {
        let wav = wav_bytes(pcm, limits::SAMPLE_RATE);
        let mut form = Form::new()
            .part(
                "file",
                Part::bytes(wav)
                    .file_name("chunk.wav")
                    .mime_str("audio/wav")
                    .expect("static mime type"),
            )
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("task", task.to_string());
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }
        if let Some(prompt) = prompt {
            form = form.text("prompt", prompt.to_string());
        }
        form
    }

    async fn send_once(
        &self,
        pcm: &[f32],
        language: Option<&str>,
        task: &str,
        prompt: Option<&str>,
    ) -> Result<VerboseResponse, AsrError> {
        let url = format!("{}/v1/audio/transcriptions", self.endpoint);
        let mut request = self
            .client
            .post(&url)
            .multipart(self.form(pcm, language, task, prompt));
        if let Some(key) = &self.api_key {
            request = request
                .header("Authorization", format!("Bearer {key}"))
                .header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AsrError::Failed(format!("request error: {e}")))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after_sec = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(1.0);
            return Err(AsrError::Overloaded {
                retry_after_sec,
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AsrError::Failed(format!("body read error: {e}")))?;

        if !status.is_success() {
            // Some deployments report saturation with a 200-family proxy in
            // front; treat an explicit marker the same as 429/503.
            if body.to_ascii_lowercase().contains("overloaded") {
                return Err(AsrError::Overloaded {
                    retry_after_sec: 1.0,
                    status: status.as_u16(),
                });
            }
            return Err(AsrError::Failed(format!(
                "transcriber returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        serde_json::from_str(&body).map_err(|e| AsrError::Failed(format!("bad response: {e}")))
    }
}

#[async_trait::async_trait]
impl Transcriber for RemoteHttpTranscriber {
    fn name(&self) -> &'static str {
        "remote_http"
    }

    async fn transcribe(
        &self,
        pcm: &[f32],
        language: Option<&str>,
        task: &str,
        prompt: Option<&str>,
    ) -> Result<(Vec<AsrSegment>, AsrInfo), AsrError> {
        let mut last_err = None;
        // One initial attempt plus up to ASR_MAX_RETRIES retries.
        for attempt in 0..=limits::ASR_MAX_RETRIES {
            match self.send_once(pcm, language, task, prompt).await {
                Ok(response) => {
                    let info = AsrInfo {
                        language: response.language.clone(),
                        language_probability: response.language_probability.unwrap_or(0.0),
                        duration_sec: response
                            .duration
                            .unwrap_or(pcm.len() as f64 / limits::SAMPLE_RATE as f64),
                    };
                    let segments = response
                        .segments
                        .into_iter()
                        .map(|s| AsrSegment {
                            start: s.start,
                            end: s.end,
                            text: s.text,
                            no_speech_prob: s.no_speech_prob,
                            avg_logprob: s.avg_logprob,
                            compression_ratio: s.compression_ratio,
                        })
                        .collect();
                    return Ok((segments, info));
                }
                // Overload is not retried here: the session handles it by
                // re-buffering, so bubbling up fast matters.
                Err(overloaded @ AsrError::Overloaded { .. }) => return Err(overloaded),
                Err(err) => {
                    if attempt < limits::ASR_MAX_RETRIES {
                        let backoff = Duration::from_secs(
                            (1u64 << attempt).min(limits::ASR_BACKOFF_CAP_SECS),
                        );
                        log::warn!(
                            "[ASR] remote pass failed (attempt {}/{}), retrying in {:?}: {}",
                            attempt + 1,
                            limits::ASR_MAX_RETRIES + 1,
                            backoff,
                            err
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AsrError::Failed("retries exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overload_is_surfaced_with_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/audio/transcriptions")
            .with_status(503)
            .with_header("Retry-After", "2")
            .create_async()
            .await;

        let t = RemoteHttpTranscriber::new(server.url(), None, "large-v3-turbo".into());
        let err = t
            .transcribe(&[0.0; 16_000], None, "transcribe", None)
            .await
            .unwrap_err();
        match err {
            AsrError::Overloaded {
                retry_after_sec,
                status,
            } => {
                assert_eq!(retry_after_sec, 2.0);
                assert_eq!(status, 503);
            }
            other => panic!("expected Overloaded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verbose_json_is_mapped_to_segments() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/audio/transcriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"language":"en","duration":4.0,
                    "segments":[{"start":0.0,"end":4.0,"text":"hello world.",
                                 "no_speech_prob":0.05,"avg_logprob":-0.2,
                                 "compression_ratio":1.1}]}"#,
            )
            .create_async()
            .await;

        let t = RemoteHttpTranscriber::new(server.url(), None, "large-v3-turbo".into());
        let (segments, info) = t
            .transcribe(&[0.0; 64_000], Some("en"), "transcribe", None)
            .await
            .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello world.");
        assert_eq!(info.language.as_deref(), Some("en"));
        assert_eq!(info.duration_sec, 4.0);
    }
}
