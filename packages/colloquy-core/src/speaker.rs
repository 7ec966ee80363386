//! Speaker attribution from mic-activity bitmaps.
//!
//! Bots report who is speaking out-of-band: each `speaker_activity_update`
//! carries, per participant, a string of `'0'`/`'1'` bits where each bit is a
//! 100 ms slot trailing backwards from the update's timestamp. Attribution
//! correlates those slots with transcript segment intervals and assigns the
//! speaker whose activity covers the largest share of the segment.

use chrono::{DateTime, Duration, Utc};

use crate::limits;
use crate::segment::Segment;

/// One raw activity snapshot for one participant.
#[derive(Debug, Clone)]
pub struct SpeakerActivityEntry {
    pub user_id: String,
    pub name: String,
    /// Wall-clock time of the snapshot; bits trail backwards from here.
    pub timestamp: DateTime<Utc>,
    pub meta_bits: String,
}

/// A merged contiguous period of one speaker's activity.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerActivityInterval {
    pub speaker_id: String,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub level: f32,
}

impl SpeakerActivityInterval {
    /// Overlap with `[start, end)` in seconds; zero when disjoint.
    fn overlap_secs(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        let overlap_start = self.start.max(start);
        let overlap_end = self.end.min(end);
        if overlap_end > overlap_start {
            (overlap_end - overlap_start).num_milliseconds() as f64 / 1000.0
        } else {
            0.0
        }
    }
}

/// Expands raw entries into per-speaker intervals, merging slots that touch
/// or overlap. Entries with empty bit strings contribute nothing.
pub fn build_intervals(entries: &[SpeakerActivityEntry]) -> Vec<SpeakerActivityInterval> {
    use std::collections::BTreeMap;

    let slot = Duration::milliseconds((limits::SPEAKER_SLOT_SECS * 1000.0) as i64);

    // Expand '1' bits into slots, grouped per speaker.
    let mut slots_by_speaker: BTreeMap<String, (String, Vec<(DateTime<Utc>, DateTime<Utc>)>)> =
        BTreeMap::new();
    for entry in entries {
        if entry.meta_bits.is_empty() {
            continue;
        }
        let num_bits = entry.meta_bits.len() as i32;
        let slots = slots_by_speaker
            .entry(entry.user_id.clone())
            .or_insert_with(|| (entry.name.clone(), Vec::new()));
        for (i, bit) in entry.meta_bits.chars().enumerate() {
            if bit != '1' {
                continue;
            }
            let trailing = num_bits - i as i32;
            let slot_start = entry.timestamp - slot * trailing;
            let slot_end = entry.timestamp - slot * (trailing - 1);
            slots.1.push((slot_start, slot_end));
        }
    }

    let mut intervals = Vec::new();
    for (speaker_id, (name, mut slots)) in slots_by_speaker {
        if slots.is_empty() {
            continue;
        }
        slots.sort_by_key(|&(start, _)| start);
        let (mut cur_start, mut cur_end) = slots[0];
        for &(next_start, next_end) in &slots[1..] {
            if next_start <= cur_end {
                cur_end = cur_end.max(next_end);
            } else {
                intervals.push(SpeakerActivityInterval {
                    speaker_id: speaker_id.clone(),
                    name: name.clone(),
                    start: cur_start,
                    end: cur_end,
                    level: 1.0,
                });
                (cur_start, cur_end) = (next_start, next_end);
            }
        }
        intervals.push(SpeakerActivityInterval {
            speaker_id,
            name,
            start: cur_start,
            end: cur_end,
            level: 1.0,
        });
    }

    intervals.sort_by_key(|iv| iv.start);
    intervals
}

/// Assigns speakers to transcript segments for one session.
#[derive(Debug, Clone)]
pub struct SpeakerMatcher {
    /// Wall-clock time of session start; segment seconds map to `t0 + start`.
    t0: DateTime<Utc>,
}

impl SpeakerMatcher {
    pub fn new(t0: DateTime<Utc>) -> Self {
        Self { t0 }
    }

    /// Matches segments against a snapshot of activity entries.
    ///
    /// The caller passes a copy of the activity list so incoming updates
    /// cannot race the matching pass. Segments keep their existing (empty)
    /// attribution when no interval wins more than half the segment.
    pub fn assign(&self, entries: &[SpeakerActivityEntry], segments: &mut [Segment]) {
        if entries.is_empty() || segments.is_empty() {
            return;
        }
        let intervals = build_intervals(entries);
        if intervals.is_empty() {
            return;
        }

        for seg in segments.iter_mut() {
            let duration = seg.duration();
            if duration <= 0.0 {
                continue;
            }
            let abs_start = self.t0 + Duration::milliseconds((seg.start * 1000.0) as i64);
            let abs_end = self.t0 + Duration::milliseconds((seg.end * 1000.0) as i64);

            let mut best: Option<(&SpeakerActivityInterval, f64)> = None;
            for interval in &intervals {
                let overlap = interval.overlap_secs(abs_start, abs_end);
                if overlap <= 0.0 {
                    continue;
                }
                let ratio = overlap / duration;
                if best.map(|(_, r)| ratio > r).unwrap_or(true) {
                    best = Some((interval, ratio));
                }
            }

            if let Some((interval, ratio)) = best {
                if ratio > limits::SPEAKER_OVERLAP_RATIO {
                    seg.speaker_id = Some(interval.speaker_id.clone());
                    seg.speaker_name = Some(interval.name.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn entry(user: &str, name: &str, at_ms: i64, bits: &str) -> SpeakerActivityEntry {
        SpeakerActivityEntry {
            user_id: user.into(),
            name: name.into(),
            timestamp: t0() + Duration::milliseconds(at_ms),
            meta_bits: bits.into(),
        }
    }

    mod intervals {
        use super::*;

        #[test]
        fn bits_expand_backwards_from_the_timestamp() {
            // Three bits ending at t0+1s: slots cover [0.7, 1.0).
            let ivs = build_intervals(&[entry("a", "Ann", 1000, "111")]);
            assert_eq!(ivs.len(), 1);
            assert_eq!(ivs[0].start, t0() + Duration::milliseconds(700));
            assert_eq!(ivs[0].end, t0() + Duration::milliseconds(1000));
        }

        #[test]
        fn gaps_split_intervals() {
            let ivs = build_intervals(&[entry("a", "Ann", 1000, "101")]);
            assert_eq!(ivs.len(), 2);
        }

        #[test]
        fn contiguous_slots_across_entries_merge() {
            let ivs = build_intervals(&[
                entry("a", "Ann", 1000, "11"),
                entry("a", "Ann", 1200, "11"),
            ]);
            assert_eq!(ivs.len(), 1);
            assert_eq!(ivs[0].start, t0() + Duration::milliseconds(800));
            assert_eq!(ivs[0].end, t0() + Duration::milliseconds(1200));
        }

        #[test]
        fn empty_bits_contribute_nothing() {
            assert!(build_intervals(&[entry("a", "Ann", 1000, "")]).is_empty());
        }
    }

    mod matching {
        use super::*;

        /// Segment 1.0–3.0 s; A active 0.5–1.8 (0.8 s overlap, ratio 0.4),
        /// B active 1.8–3.2 (1.2 s overlap, ratio 0.6). B wins.
        #[test]
        fn highest_overlap_ratio_wins() {
            let entries = vec![
                entry("A", "Ann", 1800, &"1".repeat(13)),
                entry("B", "Bob", 3200, &"1".repeat(14)),
            ];
            let mut segs = vec![Segment::new(1.0, 3.0, "hello", true)];
            SpeakerMatcher::new(t0()).assign(&entries, &mut segs);
            assert_eq!(segs[0].speaker_id.as_deref(), Some("B"));
            assert_eq!(segs[0].speaker_name.as_deref(), Some("Bob"));
        }

        /// A ratio of exactly 0.5 must not assign a speaker.
        #[test]
        fn exact_half_overlap_is_not_assigned() {
            // Speaker active 0.0–1.0; segment 0.0–2.0 → ratio 0.5 exactly.
            let entries = vec![entry("A", "Ann", 1000, &"1".repeat(10))];
            let mut segs = vec![Segment::new(0.0, 2.0, "maybe", true)];
            SpeakerMatcher::new(t0()).assign(&entries, &mut segs);
            assert!(segs[0].speaker_id.is_none());
        }

        #[test]
        fn zero_duration_segments_are_skipped() {
            let entries = vec![entry("A", "Ann", 1000, "1111111111")];
            let mut segs = vec![Segment::new(1.0, 1.0, "", true)];
            SpeakerMatcher::new(t0()).assign(&entries, &mut segs);
            assert!(segs[0].speaker_id.is_none());
        }

        #[test]
        fn no_activity_leaves_segments_untouched() {
            let mut segs = vec![Segment::new(0.0, 2.0, "quiet", true)];
            SpeakerMatcher::new(t0()).assign(&[], &mut segs);
            assert!(segs[0].speaker_id.is_none());
        }
    }
}
