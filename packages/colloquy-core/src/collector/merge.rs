//! Per-session mutable segment maps and the merge rules.
//!
//! Each live session owns a map keyed by segment start time (rounded to the
//! millisecond). Partials are overwritten freely, finals win over partials,
//! and a partial can never displace a final. The promoter reads the same
//! maps under the per-session lock and drains keys once they have been
//! stable long enough.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::segment::Segment;

/// One map entry: the segment plus the time of its newest write.
#[derive(Debug, Clone)]
pub struct MutableSegment {
    pub segment: Segment,
    pub updated_at: Instant,
}

/// Mutable per-session state between `session_start` and promotion drain.
#[derive(Debug)]
pub struct SessionBuffer {
    pub session_uid: String,
    pub meeting_id: String,
    pub token: String,
    pub platform: String,
    pub started_at: DateTime<Utc>,
    pub segments: BTreeMap<i64, MutableSegment>,
    /// Set on `session_end`; the session is dropped once drained.
    pub ended: bool,
}

impl SessionBuffer {
    /// Merges incoming segments. Returns `true` when anything changed
    /// (re-merging an identical update is a no-op).
    pub fn merge(&mut self, incoming: &[Segment]) -> bool {
        let mut changed = false;
        for seg in incoming {
            let key = seg.start_key();
            match self.segments.get(&key) {
                // A partial never overwrites a final.
                Some(existing) if existing.segment.completed && !seg.completed => continue,
                // Identical content does not count as a new write; promotion
                // stability would otherwise never be reached under steady
                // re-sends.
                Some(existing) if existing.segment == *seg => continue,
                _ => {
                    self.segments.insert(
                        key,
                        MutableSegment {
                            segment: seg.clone(),
                            updated_at: Instant::now(),
                        },
                    );
                    changed = true;
                }
            }
        }
        changed
    }

    /// Keys stable for at least `threshold_secs`, with their observed write
    /// stamps. The caller persists them and then calls [`Self::drain`].
    pub fn promotable(&self, threshold_secs: u64) -> Vec<(i64, Instant, Segment)> {
        self.segments
            .iter()
            .filter(|(_, entry)| entry.updated_at.elapsed().as_secs() >= threshold_secs)
            .map(|(&key, entry)| {
                let mut segment = entry.segment.clone();
                // A key that stayed stable through the threshold is final
                // even if its last write was a partial.
                segment.completed = true;
                (key, entry.updated_at, segment)
            })
            .collect()
    }

    /// Removes promoted keys, skipping any that were rewritten since the
    /// promoter captured them.
    pub fn drain(&mut self, promoted: &[(i64, Instant, Segment)]) {
        for (key, seen_at, _) in promoted {
            if let Some(entry) = self.segments.get(key) {
                if entry.updated_at == *seen_at {
                    self.segments.remove(key);
                }
            }
        }
    }
}

pub type SharedSession = Arc<Mutex<SessionBuffer>>;

/// All live sessions, keyed by `session_uid`.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, SharedSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or reopens) the session. Reopening keeps the existing map;
    /// the stream is at-least-once and `session_start` can be redelivered.
    pub fn open(
        &self,
        session_uid: &str,
        meeting_id: &str,
        token: &str,
        platform: &str,
        started_at: DateTime<Utc>,
    ) -> SharedSession {
        self.sessions
            .entry(session_uid.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionBuffer {
                    session_uid: session_uid.to_string(),
                    meeting_id: meeting_id.to_string(),
                    token: token.to_string(),
                    platform: platform.to_string(),
                    started_at,
                    segments: BTreeMap::new(),
                    ended: false,
                }))
            })
            .clone()
    }

    pub fn get(&self, session_uid: &str) -> Option<SharedSession> {
        self.sessions.get(session_uid).map(|s| s.clone())
    }

    pub fn mark_ended(&self, session_uid: &str) {
        if let Some(session) = self.get(session_uid) {
            session.lock().ended = true;
        }
    }

    pub fn remove(&self, session_uid: &str) {
        self.sessions.remove(session_uid);
    }

    /// Snapshot of all sessions for the promoter sweep.
    pub fn all(&self) -> Vec<SharedSession> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    /// The currently-known mutable segments for one meeting, merged across
    /// its sessions, sorted by start, trimmed to the most recent `limit`.
    pub fn meeting_snapshot(&self, meeting_id: &str, limit: usize) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.lock();
            if session.meeting_id == meeting_id {
                segments.extend(session.segments.values().map(|m| m.segment.clone()));
            }
        }
        segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
        let excess = segments.len().saturating_sub(limit);
        if excess > 0 {
            segments.drain(..excess);
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> SessionBuffer {
        SessionBuffer {
            session_uid: "s1".into(),
            meeting_id: "42".into(),
            token: "T".into(),
            platform: "gm".into(),
            started_at: Utc::now(),
            segments: BTreeMap::new(),
            ended: false,
        }
    }

    fn seg(start: f64, text: &str, completed: bool) -> Segment {
        Segment::new(start, start + 1.0, text, completed)
    }

    #[test]
    fn partial_is_upserted_by_newer_partial() {
        let mut buf = buffer();
        assert!(buf.merge(&[seg(0.0, "I think we sh", false)]));
        assert!(buf.merge(&[seg(0.0, "I think we should", false)]));
        assert_eq!(buf.segments.len(), 1);
        assert_eq!(
            buf.segments.values().next().unwrap().segment.text,
            "I think we should"
        );
    }

    #[test]
    fn final_overrides_partial_but_not_vice_versa() {
        let mut buf = buffer();
        buf.merge(&[seg(0.0, "draft", false)]);
        assert!(buf.merge(&[seg(0.0, "final text.", true)]));
        // A late partial re-send must not clobber the final.
        assert!(!buf.merge(&[seg(0.0, "draft again", false)]));
        assert_eq!(buf.segments.values().next().unwrap().segment.text, "final text.");
    }

    /// A hypothesis that firms up across passes leaves exactly one final
    /// behind for the promoter.
    #[test]
    fn partial_stabilises_then_finalises_to_one_final() {
        let mut buf = buffer();
        buf.merge(&[Segment::new(0.0, 2.5, "I think we sh", false)]);
        buf.merge(&[Segment::new(0.0, 2.9, "I think we should ship it.", true)]);
        let promoted = buf.promotable(0);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].2.text, "I think we should ship it.");
        assert!(promoted[0].2.completed);
    }

    #[test]
    fn identical_merge_is_a_no_op() {
        let mut buf = buffer();
        let s = seg(1.5, "same", false);
        assert!(buf.merge(std::slice::from_ref(&s)));
        assert!(!buf.merge(std::slice::from_ref(&s)));
    }

    #[test]
    fn distinct_start_slots_do_not_collide() {
        let mut buf = buffer();
        buf.merge(&[seg(0.0, "a", true), seg(1.0, "b", true), seg(1.001, "c", true)]);
        assert_eq!(buf.segments.len(), 3);
    }

    #[test]
    fn promotable_marks_stable_partials_final() {
        let mut buf = buffer();
        buf.merge(&[seg(0.0, "stable partial", false)]);
        // Threshold zero: everything currently in the map qualifies.
        let promoted = buf.promotable(0);
        assert_eq!(promoted.len(), 1);
        assert!(promoted[0].2.completed);
    }

    #[test]
    fn drain_skips_keys_rewritten_after_capture() {
        let mut buf = buffer();
        buf.merge(&[seg(0.0, "v1", false)]);
        let promoted = buf.promotable(0);
        // A newer write lands between capture and drain.
        buf.merge(&[seg(0.0, "v2", false)]);
        buf.drain(&promoted);
        assert_eq!(buf.segments.len(), 1);
        assert_eq!(buf.segments.values().next().unwrap().segment.text, "v2");
    }

    #[test]
    fn meeting_snapshot_merges_sessions_and_trims() {
        let store = SessionStore::new();
        let a = store.open("s1", "42", "T", "gm", Utc::now());
        let b = store.open("s2", "42", "T", "gm", Utc::now());
        let other = store.open("s3", "7", "T", "gm", Utc::now());
        a.lock().merge(&[seg(0.0, "a", true), seg(2.0, "c", true)]);
        b.lock().merge(&[seg(1.0, "b", true)]);
        other.lock().merge(&[seg(0.0, "unrelated", true)]);

        let snapshot = store.meeting_snapshot("42", 2);
        assert_eq!(snapshot.len(), 2);
        // Most recent two by start time, still sorted.
        assert_eq!(snapshot[0].text, "b");
        assert_eq!(snapshot[1].text, "c");
    }
}
