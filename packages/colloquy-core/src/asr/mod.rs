//! Pluggable ASR backends.
//!
//! All variants satisfy the same contract: hand them a chunk of Float32 mono
//! PCM at 16 kHz and get back raw hypothesis segments plus language info.
//! Backends are safe to call concurrently across sessions (the gateway fans
//! out) but each session serializes its own calls; none of them mutate the
//! input buffer.

mod cloud;
#[cfg(feature = "local-asr")]
mod local;
mod remote;
pub mod service;

pub use cloud::CloudStreamingTranscriber;
#[cfg(feature = "local-asr")]
pub use local::LocalTranscriber;
pub use remote::RemoteHttpTranscriber;
pub use service::{AdmissionGate, TranscriberServiceConfig};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{AsrBackendKind, GatewayConfig};
use crate::error::{ColloquyError, ColloquyResult};
use crate::limits;

/// One raw hypothesis segment from an ASR pass, chunk-relative times.
#[derive(Debug, Clone)]
pub struct AsrSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub no_speech_prob: f32,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
}

/// Pass-level metadata.
#[derive(Debug, Clone, Default)]
pub struct AsrInfo {
    pub language: Option<String>,
    pub language_probability: f32,
    pub duration_sec: f64,
}

/// Errors a backend can surface to the session loop.
#[derive(Debug, Error)]
pub enum AsrError {
    /// The backend is saturated; the session re-buffers the chunk and skips
    /// this pass without advancing offsets.
    #[error("transcriber overloaded (status {status}), retry after {retry_after_sec}s")]
    Overloaded { retry_after_sec: f64, status: u16 },

    /// The pass failed after exhausting retries.
    #[error("transcription failed: {0}")]
    Failed(String),
}

/// Uniform contract over the transcription backends.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Short backend identifier, reported in `SERVER_READY`.
    fn name(&self) -> &'static str;

    /// Minimum chunk duration worth dispatching (seconds).
    fn min_chunk_secs(&self) -> f64 {
        limits::MIN_CHUNK_SECS_BATCH
    }

    async fn transcribe(
        &self,
        pcm: &[f32],
        language: Option<&str>,
        task: &str,
        prompt: Option<&str>,
    ) -> Result<(Vec<AsrSegment>, AsrInfo), AsrError>;
}

/// Builds the backend selected by the gateway configuration.
pub fn build_transcriber(cfg: &GatewayConfig) -> ColloquyResult<Arc<dyn Transcriber>> {
    match cfg.backend {
        AsrBackendKind::Remote => Ok(Arc::new(RemoteHttpTranscriber::new(
            cfg.transcriber_url.clone(),
            cfg.transcriber_api_key.clone(),
            cfg.transcriber_model.clone(),
        ))),
        AsrBackendKind::Cloud => Ok(Arc::new(CloudStreamingTranscriber::new(
            cfg.transcriber_url.clone(),
            cfg.transcriber_api_key.clone(),
        ))),
        #[cfg(feature = "local-asr")]
        AsrBackendKind::Local => Ok(Arc::new(LocalTranscriber::new(&cfg.transcriber_model)?)),
        #[cfg(not(feature = "local-asr"))]
        AsrBackendKind::Local => Err(ColloquyError::Configuration(
            "local backend requested but the binary was built without the local-asr feature"
                .into(),
        )),
    }
}

/// Converts Float32 samples to interleaved signed 16-bit little-endian PCM.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Wraps 16 kHz mono Float32 samples into a 16-bit WAV container.
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let pcm = f32_to_pcm16(samples);
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * 2;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(&pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_clamps_out_of_range_samples() {
        let bytes = f32_to_pcm16(&[2.0, -2.0]);
        assert_eq!(
            bytes,
            [i16::MAX.to_le_bytes(), (-i16::MAX).to_le_bytes()].concat()
        );
    }

    #[test]
    fn wav_header_describes_mono_16khz_s16() {
        let wav = wav_bytes(&[0.0; 160], 16_000);
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // data chunk length = 160 samples * 2 bytes
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 320);
        assert_eq!(wav.len(), 44 + 320);
    }
}
