//! Cloud-streaming transcriber over a persistent duplex WebSocket.
//!
//! The channel stays open across passes: PCM goes out as binary frames, the
//! service answers with JSON hypothesis batches in the same schema the batch
//! backends produce. The connection is re-established lazily after errors.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{f32_to_pcm16, AsrError, AsrInfo, AsrSegment, Transcriber};
use crate::limits;

/// How long to wait for a hypothesis batch before treating the pass as empty.
const RESPONSE_TIMEOUT_SECS: u64 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct CloudStreamingTranscriber {
    url: String,
    api_key: Option<String>,
    conn: Mutex<Option<WsStream>>,
}

#[derive(Deserialize)]
struct CloudResponse {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<CloudSegment>,
}

#[derive(Deserialize)]
struct CloudSegment {
    start: f64,
    end: f64,
    #[serde(default)]
    text: String,
    #[serde(default)]
    no_speech_prob: f32,
    #[serde(default)]
    avg_logprob: f32,
    #[serde(default = "default_ratio")]
    compression_ratio: f32,
}

fn default_ratio() -> f32 {
    1.0
}

impl CloudStreamingTranscriber {
    pub fn new(url: String, api_key: Option<String>) -> Self {
        Self {
            url,
            api_key,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<WsStream, AsrError> {
        let url = match &self.api_key {
            Some(key) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, sep, key)
            }
            None => self.url.clone(),
        };
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| AsrError::Failed(format!("cloud connect failed: {e}")))?;
        log::info!("[ASR] cloud streaming channel established");
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl Transcriber for CloudStreamingTranscriber {
    fn name(&self) -> &'static str {
        "cloud_streaming"
    }

    fn min_chunk_secs(&self) -> f64 {
        limits::MIN_CHUNK_SECS_STREAMING
    }

    async fn transcribe(
        &self,
        pcm: &[f32],
        _language: Option<&str>,
        _task: &str,
        _prompt: Option<&str>,
    ) -> Result<(Vec<AsrSegment>, AsrInfo), AsrError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let stream = guard.as_mut().expect("connection established above");

        if let Err(e) = stream
            .send(Message::Binary(f32_to_pcm16(pcm).into()))
            .await
        {
            // Drop the broken channel; the next pass reconnects.
            *guard = None;
            return Err(AsrError::Failed(format!("cloud send failed: {e}")));
        }

        // Collect the next hypothesis batch; silence on the channel within
        // the timeout simply means no speech was finalized for this chunk.
        let deadline = tokio::time::sleep(Duration::from_secs(RESPONSE_TIMEOUT_SECS));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok((Vec::new(), AsrInfo::default())),
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let response: CloudResponse = match serde_json::from_str(&text) {
                            Ok(r) => r,
                            Err(e) => {
                                log::debug!("[ASR] unparseable cloud frame dropped: {e}");
                                continue;
                            }
                        };
                        let info = AsrInfo {
                            // Streaming services report region-tagged codes
                            // ("en-US"); only the primary subtag travels on.
                            language: response
                                .language
                                .map(|l| l.split('-').next().unwrap_or(&l).to_lowercase()),
                            language_probability: 0.0,
                            duration_sec: pcm.len() as f64 / limits::SAMPLE_RATE as f64,
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
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        *guard = None;
                        return Err(AsrError::Failed("cloud channel closed".into()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        *guard = None;
                        return Err(AsrError::Failed(format!("cloud receive failed: {e}")));
                    }
                },
            }
        }
    }
}
