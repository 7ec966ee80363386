//! Canonical transcript segments and hypothesis stabilisation.
//!
//! ASR output for a rolling window is tentative: every pass re-decodes the
//! same audio tail, so the trailing hypothesis flips around until either new
//! committed segments land in front of it or it stops changing. The
//! [`SegmentStabilizer`] turns raw per-pass output into a stream of immutable
//! finals plus at most one live partial, and tells the caller how far the
//! session clock may advance.

use serde::{Deserialize, Serialize};

use crate::asr::AsrSegment;
use crate::limits;

/// Canonical transcript segment as it travels through the pipeline.
///
/// `start`/`end` are seconds relative to the session start; they are rounded
/// to three decimals on the wire so map keys derived from them are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub completed: bool,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: &str, completed: bool) -> Self {
        Self {
            start: round3(start),
            end: round3(end),
            text: text.trim().to_string(),
            speaker_id: None,
            speaker_name: None,
            language: None,
            confidence: 0.0,
            completed,
        }
    }

    /// Segment duration in seconds. May be zero for degenerate input.
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Map key used wherever segments are stored by start slot:
    /// start time rounded to the millisecond.
    pub fn start_key(&self) -> i64 {
        (self.start * 1000.0).round() as i64
    }
}

/// Rounds to three decimal places (millisecond precision).
pub fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Output of one stabilisation pass.
#[derive(Debug, Default)]
pub struct StabilizeOutcome {
    /// Segments committed by this pass, in order.
    pub finals: Vec<Segment>,
    /// The live trailing hypothesis, if any.
    pub partial: Option<Segment>,
    /// Seconds of the chunk that are now committed; the caller advances
    /// `timestamp_offset_sec` by this amount.
    pub advance_sec: Option<f64>,
}

/// Stabilises hypotheses across overlapping ASR passes for one session.
///
/// All segments of a pass except the last are committed provisionally (their
/// audio will not be re-decoded once the offset advances past them). The last
/// segment stays partial because its trailing word may be cut by the chunk
/// boundary; it is promoted only once the same text has been observed for
/// enough consecutive passes.
#[derive(Debug)]
pub struct SegmentStabilizer {
    no_speech_threshold: f32,
    logprob_threshold: f32,
    compression_ratio_threshold: f32,
    same_output_threshold: u32,

    prev_out: String,
    same_output_count: u32,
    /// Chunk-relative end time captured on the first repetition. Later
    /// repeats may re-decode slightly different audio, so the first
    /// observation is the trustworthy end of the repeated speech.
    end_time_for_same_output: Option<f64>,
    last_committed_text: Option<String>,
}

impl Default for SegmentStabilizer {
    fn default() -> Self {
        Self::new(
            limits::NO_SPEECH_THRESHOLD,
            limits::LOGPROB_THRESHOLD,
            limits::COMPRESSION_RATIO_THRESHOLD,
            limits::SAME_OUTPUT_THRESHOLD,
        )
    }
}

impl SegmentStabilizer {
    pub fn new(
        no_speech_threshold: f32,
        logprob_threshold: f32,
        compression_ratio_threshold: f32,
        same_output_threshold: u32,
    ) -> Self {
        Self {
            no_speech_threshold,
            logprob_threshold,
            compression_ratio_threshold,
            same_output_threshold,
            prev_out: String::new(),
            same_output_count: 0,
            end_time_for_same_output: None,
            last_committed_text: None,
        }
    }

    fn accepts(&self, s: &AsrSegment) -> bool {
        s.no_speech_prob <= self.no_speech_threshold
            && s.avg_logprob >= self.logprob_threshold
            && s.compression_ratio <= self.compression_ratio_threshold
    }

    /// Processes one ASR pass for the chunk starting at `offset_sec` with
    /// length `duration_sec`.
    pub fn ingest(
        &mut self,
        offset_sec: f64,
        duration_sec: f64,
        segments: &[AsrSegment],
    ) -> StabilizeOutcome {
        let mut outcome = StabilizeOutcome::default();
        let Some(last) = segments.last() else {
            return outcome;
        };

        // Everything before the last segment is committed provisionally.
        for s in &segments[..segments.len() - 1] {
            let start = offset_sec + s.start;
            let end = offset_sec + s.end.min(duration_sec);
            if start >= end {
                continue;
            }
            if !self.accepts(s) {
                continue;
            }
            let mut seg = Segment::new(start, end, &s.text, true);
            seg.confidence = confidence_from_logprob(s.avg_logprob);
            self.last_committed_text = Some(seg.text.clone());
            outcome.finals.push(seg);
            outcome.advance_sec = Some(s.end.min(duration_sec));
        }

        // The trailing hypothesis is always partial.
        let mut current_out = String::new();
        if self.accepts(last) {
            current_out = last.text.trim().to_string();
            let start = offset_sec + last.start;
            let end = offset_sec + last.end.min(duration_sec);
            if start < end && !current_out.is_empty() {
                let mut seg = Segment::new(start, end, &current_out, false);
                seg.confidence = confidence_from_logprob(last.avg_logprob);
                outcome.partial = Some(seg);
            }
        }

        // Track repetitions of the trailing hypothesis.
        if !current_out.is_empty() && current_out == self.prev_out {
            self.same_output_count += 1;
            if self.end_time_for_same_output.is_none() {
                self.end_time_for_same_output = Some(last.end);
            }
        } else {
            self.same_output_count = 0;
            self.end_time_for_same_output = None;
        }

        if self.same_output_count >= self.same_output_threshold {
            let end = self
                .end_time_for_same_output
                .unwrap_or(last.end)
                .min(duration_sec);
            let already_committed = self
                .last_committed_text
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case(&current_out))
                .unwrap_or(false);
            if !already_committed {
                let mut seg = Segment::new(offset_sec, offset_sec + end, &current_out, true);
                seg.confidence = confidence_from_logprob(last.avg_logprob);
                self.last_committed_text = Some(seg.text.clone());
                outcome.finals.push(seg);
            }
            outcome.partial = None;
            outcome.advance_sec = Some(end);
            self.prev_out.clear();
            self.same_output_count = 0;
            self.end_time_for_same_output = None;
        } else {
            self.prev_out = current_out;
        }

        outcome
    }
}

/// Maps an average log-probability into a [0, 1] confidence.
fn confidence_from_logprob(avg_logprob: f32) -> f32 {
    avg_logprob.exp().clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asr(start: f64, end: f64, text: &str) -> AsrSegment {
        AsrSegment {
            start,
            end,
            text: text.to_string(),
            no_speech_prob: 0.1,
            avg_logprob: -0.2,
            compression_ratio: 1.2,
        }
    }

    mod segment {
        use super::*;

        #[test]
        fn start_key_rounds_to_milliseconds() {
            let seg = Segment::new(1.2344999, 2.0, "x", true);
            assert_eq!(seg.start_key(), 1234);
        }

        #[test]
        fn text_is_stripped() {
            let seg = Segment::new(0.0, 1.0, "  hello world.  ", false);
            assert_eq!(seg.text, "hello world.");
        }

        #[test]
        fn unknown_wire_fields_are_ignored() {
            let seg: Segment = serde_json::from_str(
                r#"{"start":0.0,"end":1.5,"text":"hi","completed":true,"weird":42}"#,
            )
            .unwrap();
            assert!(seg.completed);
            assert_eq!(seg.end, 1.5);
        }
    }

    mod stabiliser {
        use super::*;

        #[test]
        fn single_segment_stays_partial() {
            let mut st = SegmentStabilizer::default();
            let out = st.ingest(0.0, 2.5, &[asr(0.0, 2.5, "I think we sh")]);
            assert!(out.finals.is_empty());
            assert_eq!(out.partial.as_ref().unwrap().text, "I think we sh");
            assert!(!out.partial.unwrap().completed);
            assert!(out.advance_sec.is_none());
        }

        #[test]
        fn all_but_last_are_committed() {
            let mut st = SegmentStabilizer::default();
            let out = st.ingest(
                10.0,
                6.0,
                &[asr(0.0, 2.0, "hello world."), asr(2.0, 5.5, "how are")],
            );
            assert_eq!(out.finals.len(), 1);
            let f = &out.finals[0];
            assert_eq!((f.start, f.end), (10.0, 12.0));
            assert!(f.completed);
            assert_eq!(out.partial.as_ref().unwrap().text, "how are");
            assert_eq!(out.advance_sec, Some(2.0));
        }

        #[test]
        fn low_quality_segments_are_dropped() {
            let mut st = SegmentStabilizer::default();
            let mut noisy = asr(0.0, 1.0, "uhh");
            noisy.no_speech_prob = 0.9;
            let mut looped = asr(1.0, 2.0, "la la la la");
            looped.compression_ratio = 3.0;
            let out = st.ingest(0.0, 3.0, &[noisy, looped, asr(2.0, 3.0, "ok")]);
            assert!(out.finals.is_empty());
            assert_eq!(out.partial.unwrap().text, "ok");
        }

        #[test]
        fn degenerate_interval_is_skipped() {
            let mut st = SegmentStabilizer::default();
            let out = st.ingest(0.0, 2.0, &[asr(1.5, 1.5, "blip"), asr(1.5, 2.0, "tail")]);
            assert!(out.finals.is_empty());
        }

        #[test]
        fn repeated_trailing_text_promotes_with_first_repeat_end() {
            let mut st = SegmentStabilizer::default();
            // First observation establishes prev_out.
            st.ingest(0.0, 4.0, &[asr(0.0, 3.0, "ship it")]);
            // The first repetition records end=3.2 as the trustworthy end.
            st.ingest(0.0, 4.0, &[asr(0.0, 3.2, "ship it")]);
            let mut promoted = None;
            for _ in 0..limits::SAME_OUTPUT_THRESHOLD {
                let out = st.ingest(0.0, 4.0, &[asr(0.0, 3.9, "ship it")]);
                if !out.finals.is_empty() {
                    promoted = Some(out);
                    break;
                }
            }
            let out = promoted.expect("repetition should promote the partial");
            let f = &out.finals[0];
            assert!(f.completed);
            assert_eq!((f.start, f.end), (0.0, 3.2));
            assert!(out.partial.is_none());
            assert_eq!(out.advance_sec, Some(3.2));
        }

        #[test]
        fn promotion_skips_text_equal_to_last_final() {
            let mut st = SegmentStabilizer::default();
            // Commit "done." as a final, leaving the same text as the tail.
            st.ingest(0.0, 5.0, &[asr(0.0, 2.0, "done."), asr(2.0, 4.0, "done.")]);
            for _ in 0..=limits::SAME_OUTPUT_THRESHOLD {
                let out = st.ingest(2.0, 3.0, &[asr(0.0, 2.0, "done.")]);
                // The offset must still advance even though no duplicate
                // final is emitted.
                if out.partial.is_none() {
                    assert!(out.finals.is_empty());
                    assert!(out.advance_sec.is_some());
                    return;
                }
            }
            panic!("repetition never resolved");
        }

        #[test]
        fn changed_text_resets_repeat_counter() {
            let mut st = SegmentStabilizer::default();
            st.ingest(0.0, 4.0, &[asr(0.0, 3.0, "almost there")]);
            st.ingest(0.0, 4.0, &[asr(0.0, 3.1, "almost there")]);
            // New content: counter must restart.
            st.ingest(0.0, 4.0, &[asr(0.0, 3.5, "almost there now")]);
            let out = st.ingest(0.0, 4.0, &[asr(0.0, 3.6, "almost there now")]);
            assert!(out.finals.is_empty());
            assert!(out.partial.is_some());
        }
    }
}
