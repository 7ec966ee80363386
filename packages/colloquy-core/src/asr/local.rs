//! In-process Whisper inference behind the `local-asr` feature.
//!
//! Model access is serialized process-wide: whisper state is not safe to
//! share across concurrent inferences, so sessions queue on one lock the
//! same way they would queue on a single GPU.

use tokio::sync::Mutex;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::{AsrError, AsrInfo, AsrSegment, Transcriber};
use crate::error::{ColloquyError, ColloquyResult};
use crate::limits;

pub struct LocalTranscriber {
    ctx: WhisperContext,
    inference: Mutex<()>,
}

impl LocalTranscriber {
    pub fn new(model_path: &str) -> ColloquyResult<Self> {
        let ctx = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
            .map_err(|e| {
                ColloquyError::Configuration(format!("failed to load whisper model: {e}"))
            })?;
        Ok(Self {
            ctx,
            inference: Mutex::new(()),
        })
    }
}

#[async_trait::async_trait]
impl Transcriber for LocalTranscriber {
    fn name(&self) -> &'static str {
        "local_whisper"
    }

    async fn transcribe(
        &self,
        pcm: &[f32],
        language: Option<&str>,
        task: &str,
        prompt: Option<&str>,
    ) -> Result<(Vec<AsrSegment>, AsrInfo), AsrError> {
        let _serialize = self.inference.lock().await;

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| AsrError::Failed(format!("whisper state: {e}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_translate(task == "translate");
        if let Some(lang) = language {
            params.set_language(Some(lang));
        }
        if let Some(prompt) = prompt {
            params.set_initial_prompt(prompt);
        }
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_special(false);

        state
            .full(params, pcm)
            .map_err(|e| AsrError::Failed(format!("whisper inference: {e}")))?;

        let n = state
            .full_n_segments()
            .map_err(|e| AsrError::Failed(format!("whisper segments: {e}")))?;
        let mut segments = Vec::with_capacity(n as usize);
        for i in 0..n {
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| AsrError::Failed(format!("whisper text: {e}")))?;
            // Timestamps are reported in centiseconds.
            let start = state.full_get_segment_t0(i).unwrap_or(0) as f64 / 100.0;
            let end = state.full_get_segment_t1(i).unwrap_or(0) as f64 / 100.0;
            segments.push(AsrSegment {
                start,
                end,
                text,
                no_speech_prob: 0.0,
                avg_logprob: 0.0,
                compression_ratio: 1.0,
            });
        }

        let info = AsrInfo {
            language: language.map(str::to_string),
            language_probability: 0.0,
            duration_sec: pcm.len() as f64 / limits::SAMPLE_RATE as f64,
        };
        Ok((segments, info))
    }
}
