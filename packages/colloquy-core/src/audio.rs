//! Per-session rolling PCM buffer and voice activity detection.
//!
//! The buffer owns two clocks measured in seconds of session audio:
//! `buffer_offset_sec` (how much audio has been discarded off the front) and
//! `timestamp_offset_sec` (where the next ASR pass begins). The invariant
//! `timestamp_offset_sec >= buffer_offset_sec` holds at all times; their
//! difference is the buffered-but-unconsumed tail.

use crate::limits;

/// Rolling Float32 PCM buffer for one session.
#[derive(Debug)]
pub struct RollingBuffer {
    samples: Vec<f32>,
    buffer_offset_sec: f64,
    timestamp_offset_sec: f64,
    sample_rate: u32,
}

impl RollingBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            buffer_offset_sec: 0.0,
            timestamp_offset_sec: 0.0,
            sample_rate,
        }
    }

    /// Appends incoming frames, sliding the buffer when it exceeds the cap.
    ///
    /// When more than 45 s is held the oldest 30 s are dropped and
    /// `buffer_offset_sec` advances by the same amount. If the consume clock
    /// fell behind the discarded region (no speech promoted for that long) it
    /// is clamped forward to the new buffer start.
    pub fn append(&mut self, frames: &[f32]) {
        let cap = (limits::BUFFER_CAP_SECS * self.sample_rate as f64) as usize;
        if self.samples.len() > cap {
            let slide = (limits::BUFFER_SLIDE_SECS * self.sample_rate as f64) as usize;
            self.samples.drain(..slide);
            self.buffer_offset_sec += limits::BUFFER_SLIDE_SECS;
            if self.timestamp_offset_sec < self.buffer_offset_sec {
                self.timestamp_offset_sec = self.buffer_offset_sec;
            }
        }
        self.samples.extend_from_slice(frames);
    }

    /// Returns the unconsumed tail starting at `timestamp_offset_sec`,
    /// together with its duration in seconds. Does not mutate offsets.
    pub fn next_chunk(&self) -> (Vec<f32>, f64) {
        let skip = ((self.timestamp_offset_sec - self.buffer_offset_sec)
            * self.sample_rate as f64)
            .max(0.0) as usize;
        let chunk: Vec<f32> = self.samples.get(skip..).unwrap_or(&[]).to_vec();
        let duration = chunk.len() as f64 / self.sample_rate as f64;
        (chunk, duration)
    }

    /// Forces the window forward when no segment has been promoted for a
    /// long stretch: a tail over 25 s collapses to the last 5 s.
    ///
    /// Returns `true` if the offset was moved.
    pub fn clip_if_stalled(&mut self) -> bool {
        let tail_samples = ((self.timestamp_offset_sec - self.buffer_offset_sec)
            * self.sample_rate as f64)
            .max(0.0) as usize;
        let tail_len = self.samples.len().saturating_sub(tail_samples);
        if tail_len as f64 / self.sample_rate as f64 > limits::STALL_TAIL_SECS {
            let total = self.samples.len() as f64 / self.sample_rate as f64;
            self.timestamp_offset_sec =
                self.buffer_offset_sec + total - limits::STALL_KEEP_SECS;
            true
        } else {
            false
        }
    }

    /// Advances the consume clock after committed segments.
    pub fn advance(&mut self, secs: f64) {
        self.timestamp_offset_sec += secs;
        if self.timestamp_offset_sec < self.buffer_offset_sec {
            self.timestamp_offset_sec = self.buffer_offset_sec;
        }
    }

    pub fn timestamp_offset_sec(&self) -> f64 {
        self.timestamp_offset_sec
    }

    pub fn buffer_offset_sec(&self) -> f64 {
        self.buffer_offset_sec
    }

    /// Seconds of audio currently held (consumed or not).
    pub fn held_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// What the detector concluded about the most recent audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadStatus {
    Speech,
    Silence,
}

/// Cheap energy/onset detector consulted per ~100 ms window.
///
/// Audio accumulates regardless of the verdict; the only output is an
/// end-of-utterance flag raised after three consecutive silent windows,
/// which the session uses to prefer dispatching at utterance boundaries.
#[derive(Debug)]
pub struct EnergyVad {
    threshold: f32,
    window_samples: usize,
    pending: Vec<f32>,
    silent_run: u32,
    end_of_utterance: bool,
}

impl EnergyVad {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            threshold: limits::VAD_RMS_THRESHOLD,
            window_samples: (sample_rate as u64 * limits::VAD_WINDOW_MS as u64 / 1000) as usize,
            pending: Vec::new(),
            silent_run: 0,
            end_of_utterance: false,
        }
    }

    /// Feeds frames into the detector; whole windows are classified, the
    /// remainder is held for the next call.
    pub fn push(&mut self, frames: &[f32]) {
        self.pending.extend_from_slice(frames);
        while self.pending.len() >= self.window_samples {
            let window: Vec<f32> = self.pending.drain(..self.window_samples).collect();
            match classify(&window, self.threshold) {
                VadStatus::Silence => {
                    self.silent_run += 1;
                    if self.silent_run >= limits::VAD_SILENT_WINDOWS {
                        self.end_of_utterance = true;
                    }
                }
                VadStatus::Speech => {
                    self.silent_run = 0;
                    self.end_of_utterance = false;
                }
            }
        }
    }

    /// Reads and clears the end-of-utterance flag.
    pub fn take_end_of_utterance(&mut self) -> bool {
        std::mem::take(&mut self.end_of_utterance)
    }
}

/// Whether a whole chunk is below the silence threshold. Used by the session
/// loop to skip ASR passes over pure silence once end-of-utterance fired.
pub fn chunk_is_silent(samples: &[f32]) -> bool {
    !samples.is_empty() && classify(samples, limits::VAD_RMS_THRESHOLD) == VadStatus::Silence
}

fn classify(window: &[f32], threshold: f32) -> VadStatus {
    let energy: f32 = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
    if energy.sqrt() >= threshold {
        VadStatus::Speech
    } else {
        VadStatus::Silence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = limits::SAMPLE_RATE;

    fn secs(n: f64) -> Vec<f32> {
        vec![0.5; (n * RATE as f64) as usize]
    }

    mod rolling_buffer {
        use super::*;

        #[test]
        fn offsets_start_at_zero() {
            let buf = RollingBuffer::new(RATE);
            assert_eq!(buf.timestamp_offset_sec(), 0.0);
            assert_eq!(buf.buffer_offset_sec(), 0.0);
            assert!(buf.is_empty());
        }

        #[test]
        fn next_chunk_returns_unconsumed_tail() {
            let mut buf = RollingBuffer::new(RATE);
            buf.append(&secs(4.0));
            buf.advance(1.0);
            let (chunk, duration) = buf.next_chunk();
            assert_eq!(chunk.len(), (3.0 * RATE as f64) as usize);
            assert!((duration - 3.0).abs() < 1e-6);
        }

        #[test]
        fn overflow_slides_thirty_seconds() {
            let mut buf = RollingBuffer::new(RATE);
            buf.append(&secs(46.0));
            // The slide happens on the next append once the cap is exceeded.
            buf.append(&secs(1.0));
            assert_eq!(buf.buffer_offset_sec(), 30.0);
            // Consume clock never lags the buffer start.
            assert!(buf.timestamp_offset_sec() >= buf.buffer_offset_sec());
            assert!((buf.held_secs() - 17.0).abs() < 1e-3);
        }

        #[test]
        fn stalled_tail_clips_to_last_five_seconds() {
            let mut buf = RollingBuffer::new(RATE);
            buf.append(&secs(26.0));
            assert!(buf.clip_if_stalled());
            assert!((buf.timestamp_offset_sec() - 21.0).abs() < 1e-6);
            let (_, duration) = buf.next_chunk();
            assert!((duration - 5.0).abs() < 1e-3);
        }

        #[test]
        fn short_tail_is_not_clipped() {
            let mut buf = RollingBuffer::new(RATE);
            buf.append(&secs(10.0));
            assert!(!buf.clip_if_stalled());
            assert_eq!(buf.timestamp_offset_sec(), 0.0);
        }

        #[test]
        fn invariant_holds_across_operations() {
            let mut buf = RollingBuffer::new(RATE);
            for _ in 0..12 {
                buf.append(&secs(5.0));
                buf.advance(1.5);
                assert!(buf.timestamp_offset_sec() >= buf.buffer_offset_sec());
            }
        }
    }

    mod vad {
        use super::*;

        #[test]
        fn silence_raises_end_of_utterance_after_three_windows() {
            let mut vad = EnergyVad::new(RATE);
            vad.push(&vec![0.0; (RATE / 10 * 3) as usize]);
            assert!(vad.take_end_of_utterance());
            // Flag is cleared by the read.
            assert!(!vad.take_end_of_utterance());
        }

        #[test]
        fn speech_resets_the_silent_run() {
            let mut vad = EnergyVad::new(RATE);
            vad.push(&vec![0.0; (RATE / 10 * 2) as usize]);
            vad.push(&vec![0.5; (RATE / 10) as usize]);
            vad.push(&vec![0.0; (RATE / 10 * 2) as usize]);
            assert!(!vad.take_end_of_utterance());
        }
    }
}
