//! Fixed pipeline constants and tunable defaults.
//!
//! Values in the first group are part of the wire/audio contract and must not
//! be changed. The second group holds defaults for knobs that are overridable
//! through configuration (every one of them has an env counterpart wired in
//! the server binary).

// ─────────────────────────────────────────────────────────────────────────────
// Audio Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate of all ingested audio (Hz). Bots send Float32LE mono PCM.
pub const SAMPLE_RATE: u32 = 16_000;

/// Binary sentinel a bot sends instead of PCM to signal the end of audio.
pub const END_OF_AUDIO: &[u8] = b"END_OF_AUDIO";

// ─────────────────────────────────────────────────────────────────────────────
// Rolling Buffer
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum buffered audio per session (seconds) before the buffer slides.
pub const BUFFER_CAP_SECS: f64 = 45.0;

/// Amount of oldest audio dropped when the cap is exceeded (seconds).
pub const BUFFER_SLIDE_SECS: f64 = 30.0;

/// Unconsumed tail length (seconds) beyond which the session is considered
/// stalled and the window is forced forward.
pub const STALL_TAIL_SECS: f64 = 25.0;

/// Audio kept at the end of the buffer when a stalled window is clipped.
pub const STALL_KEEP_SECS: f64 = 5.0;

// ─────────────────────────────────────────────────────────────────────────────
// VAD
// ─────────────────────────────────────────────────────────────────────────────

/// Energy-detector analysis window (milliseconds).
pub const VAD_WINDOW_MS: u32 = 100;

/// Consecutive silent windows before the end-of-utterance flag is raised.
pub const VAD_SILENT_WINDOWS: u32 = 3;

/// Default RMS level below which a window counts as silent.
pub const VAD_RMS_THRESHOLD: f32 = 0.01;

// ─────────────────────────────────────────────────────────────────────────────
// Hypothesis Stabilisation
// ─────────────────────────────────────────────────────────────────────────────

/// Segments with a higher no-speech probability are dropped.
pub const NO_SPEECH_THRESHOLD: f32 = 0.6;

/// Segments with a lower average log-probability are dropped.
pub const LOGPROB_THRESHOLD: f32 = -1.0;

/// Segments with a higher compression ratio are dropped (decoder loops).
pub const COMPRESSION_RATIO_THRESHOLD: f32 = 2.4;

/// Identical trailing hypotheses across this many passes promote the
/// partial to a final segment.
pub const SAME_OUTPUT_THRESHOLD: u32 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// How long a fresh connection may take to send its JSON config frame.
pub const CONFIG_FRAME_TIMEOUT_SECS: u64 = 10;

/// Default concurrent-connection cap per gateway process.
pub const DEFAULT_MAX_CLIENTS: usize = 4;

/// Default per-connection lifetime (seconds).
pub const DEFAULT_MAX_CONNECTION_TIME_SECS: u64 = 600;

/// Deadline for draining pending finals when a connection closes (seconds).
pub const DRAIN_DEADLINE_SECS: u64 = 2;

/// Minimum chunk for batch-style backends (remote HTTP / local model).
pub const MIN_CHUNK_SECS_BATCH: f64 = 1.0;

/// Minimum chunk for the cloud-streaming backend.
pub const MIN_CHUNK_SECS_STREAMING: f64 = 0.4;

/// Finals kept in the per-session transcript history sent to the bot.
pub const TRANSCRIPT_HISTORY_SEGMENTS: usize = 50;

/// Trailing segments (history + partial) included in client updates.
pub const SEND_LAST_N_SEGMENTS: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Speaker Attribution
// ─────────────────────────────────────────────────────────────────────────────

/// Duration of one mic-activity bit slot (seconds).
pub const SPEAKER_SLOT_SECS: f64 = 0.1;

/// A speaker is assigned only when overlap/duration strictly exceeds this.
pub const SPEAKER_OVERLAP_RATIO: f64 = 0.5;

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Stream / Consumer Group
// ─────────────────────────────────────────────────────────────────────────────

/// Default Redis stream carrying gateway output.
pub const DEFAULT_STREAM_NAME: &str = "transcription_segments";

/// Default consumer group name on the segment stream.
pub const DEFAULT_CONSUMER_GROUP: &str = "transcription_collector_group";

/// Approximate stream trim length (entries) applied on XADD.
pub const STREAM_MAXLEN: usize = 10_000;

/// Default entries fetched per blocking read.
pub const STREAM_READ_COUNT: usize = 10;

/// Default blocking-read timeout (milliseconds).
pub const STREAM_BLOCK_MS: u64 = 2_000;

/// Default idle time after which a pending entry is claimed (milliseconds).
pub const DEFAULT_PENDING_MSG_TIMEOUT_MS: u64 = 60_000;

/// Interval between periodic stale-entry claim sweeps (seconds).
pub const CLAIM_SWEEP_INTERVAL_SECS: u64 = 60;

// ─────────────────────────────────────────────────────────────────────────────
// Promoter / Pub-Sub
// ─────────────────────────────────────────────────────────────────────────────

/// Default seconds a map key must be stable before promotion.
pub const DEFAULT_IMMUTABILITY_THRESHOLD_SECS: u64 = 30;

/// Default promoter tick interval (seconds).
pub const DEFAULT_BACKGROUND_TASK_INTERVAL_SECS: u64 = 5;

/// Most recent segments included in a `segments_updated` snapshot.
pub const DEFAULT_SNAPSHOT_SEGMENTS: usize = 50;

/// Builds the per-meeting mutable-segments pub/sub channel name.
pub fn mutable_channel(meeting_id: &str) -> String {
    format!("tc:meeting:{meeting_id}:mutable")
}

/// Pattern matching every meeting's mutable-segments channel.
pub const MUTABLE_CHANNEL_PATTERN: &str = "tc:meeting:*:mutable";

/// Builds the per-meeting decision log key.
pub fn decisions_key(meeting_id: &str) -> String {
    format!("meeting:{meeting_id}:decisions")
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision Window Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Default segments fed to the LLM per analysis pass.
pub const DEFAULT_WINDOW_SEGMENTS: usize = 30;

/// Default trailing (in-flight) segments excluded from the window.
pub const DEFAULT_OFFSET_SEGMENTS: usize = 3;

/// Default minimum spacing between LLM calls per meeting (milliseconds).
pub const DEFAULT_DEBOUNCE_MS: u64 = 2_000;

/// Slack on top of window + offset for the per-meeting segment buffer.
pub const WINDOW_BUFFER_SLACK: usize = 10;

/// Default decision-log TTL (seconds), refreshed on every append.
pub const DEFAULT_DECISIONS_TTL_SECS: u64 = 7_200;

/// Jaccard similarity at or above which two summaries are duplicates.
pub const DEFAULT_JACCARD_THRESHOLD: f64 = 0.50;

/// Containment ratio at or above which two summaries are duplicates.
pub const DEFAULT_CONTAINMENT_THRESHOLD: f64 = 0.70;

/// Capacity of each meeting's SSE broadcast channel; on overflow the
/// slowest subscriber loses the oldest items.
pub const SSE_CHANNEL_CAPACITY: usize = 100;

/// SSE keepalive comment interval (seconds).
pub const SSE_KEEPALIVE_SECS: u64 = 15;

// ─────────────────────────────────────────────────────────────────────────────
// Upstream Calls
// ─────────────────────────────────────────────────────────────────────────────

/// Default LLM request budget (seconds).
pub const LLM_TIMEOUT_SECS: u64 = 30;

/// Default model for decision extraction.
pub const DEFAULT_LLM_MODEL: &str = "gpt-4.1-mini";

/// Transient-error retries for the remote ASR backend.
pub const ASR_MAX_RETRIES: u32 = 3;

/// Exponential-backoff cap for ASR retries (seconds).
pub const ASR_BACKOFF_CAP_SECS: u64 = 10;

/// Backoff applied when a background loop dies and restarts (seconds).
pub const TASK_RESTART_BACKOFF_SECS: u64 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutable_channel_matches_pattern_shape() {
        assert_eq!(mutable_channel("42"), "tc:meeting:42:mutable");
    }

    #[test]
    fn decisions_key_is_per_meeting() {
        assert_eq!(decisions_key("99"), "meeting:99:decisions");
    }
}
