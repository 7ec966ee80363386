//! Per-meeting sliding window, debounce, and LLM dispatch.
//!
//! Every `segments_updated` message merges into the meeting's bounded
//! segment buffer. An analysis pass runs only when the debounce interval
//! has elapsed and no other pass is in flight for that meeting; bursts are
//! absorbed by the single-flight lock and re-triggered by the next update.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

use super::dedup;
use super::{DecisionItem, DecisionLog};
use crate::config::DecisionConfig;
use crate::limits;
use crate::llm::LlmClient;
use crate::segment::Segment;
use crate::tracker::TrackerStore;

/// State for one meeting under analysis.
pub struct MeetingState {
    segments: Mutex<BTreeMap<i64, Segment>>,
    /// Milliseconds since engine start of the last LLM dispatch; 0 = never.
    last_llm_call_ms: AtomicU64,
    /// Single-flight: at most one analysis per meeting at a time.
    analysis: tokio::sync::Mutex<()>,
    events: broadcast::Sender<DecisionItem>,
}

impl MeetingState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(limits::SSE_CHANNEL_CAPACITY);
        Self {
            segments: Mutex::new(BTreeMap::new()),
            last_llm_call_ms: AtomicU64::new(0),
            analysis: tokio::sync::Mutex::new(()),
            events,
        }
    }
}

/// Upserts incoming segments by start key and trims to capacity.
/// Merging the same update twice is a no-op.
pub(super) fn merge_segments(
    buffer: &mut BTreeMap<i64, Segment>,
    incoming: &[Segment],
    capacity: usize,
) {
    for seg in incoming {
        buffer.insert(seg.start_key(), seg.clone());
    }
    while buffer.len() > capacity {
        buffer.pop_first();
    }
}

/// Builds the analysis window: drop the trailing `offset` segments
/// (in-flight, still mutating), then take the last `window`.
pub(super) fn build_window(
    buffer: &BTreeMap<i64, Segment>,
    window: usize,
    offset: usize,
) -> Vec<Segment> {
    let all: Vec<&Segment> = buffer.values().collect();
    let stable = all.len().saturating_sub(offset);
    let start = stable.saturating_sub(window);
    all[start..stable].iter().map(|s| (*s).clone()).collect()
}

pub struct DecisionEngine {
    cfg: DecisionConfig,
    meetings: DashMap<String, Arc<MeetingState>>,
    log: DecisionLog,
    llm: LlmClient,
    tracker: Arc<TrackerStore>,
    epoch: Instant,
}

impl DecisionEngine {
    pub fn new(
        cfg: DecisionConfig,
        log: DecisionLog,
        llm: LlmClient,
        tracker: Arc<TrackerStore>,
    ) -> Self {
        Self {
            cfg,
            meetings: DashMap::new(),
            log,
            llm,
            tracker,
            epoch: Instant::now(),
        }
    }

    fn meeting(&self, meeting_id: &str) -> Arc<MeetingState> {
        self.meetings
            .entry(meeting_id.to_string())
            .or_insert_with(|| Arc::new(MeetingState::new()))
            .clone()
    }

    /// Live item feed for one meeting. Subscribers joining late see only
    /// future items; the snapshot endpoint serves history.
    pub fn subscribe(&self, meeting_id: &str) -> broadcast::Receiver<DecisionItem> {
        self.meeting(meeting_id).events.subscribe()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Entry point for every `segments_updated` message.
    pub async fn handle_update(&self, meeting_id: &str, segments: Vec<Segment>) {
        let state = self.meeting(meeting_id);

        let capacity =
            self.cfg.window_segments + self.cfg.offset_segments + limits::WINDOW_BUFFER_SLACK;
        {
            let mut buffer = state.segments.lock();
            merge_segments(&mut buffer, &segments, capacity);
        }

        // Debounce before windowing, so a burst of updates costs one call.
        let now = self.now_ms();
        let last = state.last_llm_call_ms.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.cfg.debounce_ms {
            log::debug!("[Decisions] {meeting_id} debounced");
            return;
        }

        let window = {
            let buffer = state.segments.lock();
            build_window(&buffer, self.cfg.window_segments, self.cfg.offset_segments)
        };
        if window.is_empty() {
            log::debug!("[Decisions] {meeting_id} empty window, skipping");
            return;
        }

        state
            .last_llm_call_ms
            .store(now.max(1), Ordering::Release);

        // Single-flight: if a pass is already running, drop this trigger;
        // the next update after the debounce window re-triggers.
        let Ok(_flight) = state.analysis.try_lock() else {
            log::debug!("[Decisions] {meeting_id} analysis already in flight");
            return;
        };

        match self.analyze(meeting_id, &window).await {
            Ok(Some(item)) => self.accept(meeting_id, &state, item).await,
            Ok(None) => {}
            Err(e) => log::error!("[Decisions] {meeting_id} analysis failed: {e}"),
        }
    }

    /// One LLM pass over the window. `None` for no_match, low confidence,
    /// or an unusable tool call.
    async fn analyze(
        &self,
        meeting_id: &str,
        window: &[Segment],
    ) -> crate::error::ColloquyResult<Option<DecisionItem>> {
        let tracker = self.tracker.get();
        let transcript = format_window(window);
        let messages = json!([
            {"role": "system", "content": tracker.build_system_prompt()},
            {"role": "user", "content": format!("Transcript window:\n\n{transcript}")},
        ]);
        let tool_choice =
            json!({"type": "function", "function": {"name": "capture_meeting_item"}});

        let response = self
            .llm
            .chat(
                messages,
                Some(tracker.build_tool_schema()),
                Some(tool_choice),
                0.1,
                256,
            )
            .await?;

        let Some(args) = LlmClient::first_tool_call_args(&response) else {
            log::warn!("[Decisions] {meeting_id} LLM returned no tool call");
            return Ok(None);
        };
        let item: DecisionItem = match serde_json::from_value(args) {
            Ok(item) => item,
            Err(e) => {
                log::warn!("[Decisions] {meeting_id} unusable tool call: {e}");
                return Ok(None);
            }
        };

        if item.item_type == "no_match" || item.summary.trim().is_empty() {
            return Ok(None);
        }
        if item.confidence < self.cfg.confidence_floor {
            log::debug!(
                "[Decisions] {meeting_id} below confidence floor ({:.2})",
                item.confidence
            );
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Dedup, persist, broadcast.
    async fn accept(&self, meeting_id: &str, state: &MeetingState, mut item: DecisionItem) {
        let stored = match self.log.summaries(meeting_id).await {
            Ok(stored) => stored,
            Err(e) => {
                // Dedup is best-effort: losing the check must not suppress
                // the item.
                log::warn!("[Decisions] {meeting_id} dedup load failed, allowing item: {e}");
                Vec::new()
            }
        };

        if dedup::is_duplicate(
            &item.summary,
            &stored,
            self.cfg.jaccard_threshold,
            self.cfg.containment_threshold,
        ) {
            log::debug!(
                "[Decisions] {meeting_id} duplicate discarded: {}",
                truncate(&item.summary, 60)
            );
            return;
        }

        // Optional semantic second pass; fails open.
        if self.cfg.llm_dedup_enabled
            && !stored.is_empty()
            && self.llm_says_duplicate(&item.summary, &stored).await
        {
            log::debug!(
                "[Decisions] {meeting_id} LLM-flagged duplicate discarded: {}",
                truncate(&item.summary, 60)
            );
            return;
        }

        item.meeting_id = Some(meeting_id.to_string());
        if let Err(e) = self.log.append(meeting_id, &item).await {
            log::error!("[Decisions] {meeting_id} failed to store item: {e}");
            return;
        }
        log::info!(
            "[Decisions] {meeting_id} captured {}: {}",
            item.item_type,
            truncate(&item.summary, 80)
        );

        // Subscribers only; no receivers is fine.
        let _ = state.events.send(item);
    }

    /// Yes/no semantic probe. Any error or ambiguity counts as "not a
    /// duplicate" so items are never silently suppressed.
    async fn llm_says_duplicate(&self, summary: &str, stored: &[String]) -> bool {
        let numbered = stored
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {s}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = json!([
            {"role": "system", "content":
                "You are a deduplication assistant. Answer with exactly one word: YES or NO."},
            {"role": "user", "content": format!(
                "New item:\n{summary}\n\nAlready captured items:\n{numbered}\n\n\
                 Does the new item describe the same thing as any already-captured item \
                 (same person, same task/decision, just worded differently)? YES or NO.")},
        ]);
        match self.llm.chat(messages, None, None, 0.0, 5).await {
            Ok(response) => LlmClient::first_content(&response)
                .map(|c| c.trim().to_uppercase().starts_with("YES"))
                .unwrap_or(false),
            Err(e) => {
                log::warn!("[Decisions] dedup probe failed (treating as unique): {e}");
                false
            }
        }
    }
}

/// Formats the window as "[12.3s] Speaker: text" lines.
fn format_window(window: &[Segment]) -> String {
    let lines: Vec<String> = window
        .iter()
        .filter(|seg| !seg.text.is_empty())
        .map(|seg| {
            let speaker = seg.speaker_name.as_deref().unwrap_or("Unknown");
            format!("[{:.1}s] {speaker}: {}", seg.start, seg.text)
        })
        .collect();
    if lines.is_empty() {
        "(no transcript yet)".to_string()
    } else {
        lines.join("\n")
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, text: &str) -> Segment {
        Segment::new(start, start + 1.0, text, true)
    }

    #[test]
    fn merging_the_same_update_twice_is_idempotent() {
        let mut buffer = BTreeMap::new();
        let update = vec![seg(0.0, "a"), seg(1.0, "b")];
        merge_segments(&mut buffer, &update, 40);
        let first = buffer.clone();
        merge_segments(&mut buffer, &update, 40);
        assert_eq!(buffer, first);
    }

    #[test]
    fn capacity_evicts_oldest_segments() {
        let mut buffer = BTreeMap::new();
        let update: Vec<Segment> = (0..10).map(|i| seg(i as f64, "x")).collect();
        merge_segments(&mut buffer, &update, 5);
        assert_eq!(buffer.len(), 5);
        assert_eq!(*buffer.keys().next().unwrap(), 5000);
    }

    #[test]
    fn window_drops_trailing_offset_then_takes_last() {
        let mut buffer = BTreeMap::new();
        let update: Vec<Segment> = (0..10).map(|i| seg(i as f64, "x")).collect();
        merge_segments(&mut buffer, &update, 40);
        let window = build_window(&buffer, 5, 3);
        assert_eq!(window.len(), 5);
        assert_eq!(window.first().unwrap().start, 2.0);
        assert_eq!(window.last().unwrap().start, 6.0);
    }

    #[test]
    fn offset_at_least_buffer_size_yields_empty_window() {
        let mut buffer = BTreeMap::new();
        merge_segments(&mut buffer, &[seg(0.0, "a"), seg(1.0, "b")], 40);
        assert!(build_window(&buffer, 30, 2).is_empty());
        assert!(build_window(&buffer, 30, 5).is_empty());
    }

    #[test]
    fn window_formatting_names_unknown_speakers() {
        let mut named = seg(3.0, "we should ship");
        named.speaker_name = Some("Ann".into());
        let text = format_window(&[named, seg(4.0, "agreed")]);
        assert!(text.contains("[3.0s] Ann: we should ship"));
        assert!(text.contains("Unknown: agreed"));
    }
}
