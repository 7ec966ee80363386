//! Wire message types: the gateway WebSocket protocol and the outbound
//! segment stream entries the collector consumes.
//!
//! Decoding is defensive throughout: unknown fields are ignored, unknown
//! message types are logged and dropped by the callers, and `meeting_id`
//! accepts either a JSON number or a string (bots disagree on this).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::segment::Segment;

/// Accepts a string or integer and yields a string.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(i64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Str(s) if s.is_empty() => Err(D::Error::custom("empty meeting_id")),
        Raw::Str(s) => Ok(s),
        Raw::Num(n) => Ok(n.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway WebSocket: bot → gateway
// ─────────────────────────────────────────────────────────────────────────────

/// First text frame on every bot connection.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub uid: String,
    pub platform: String,
    #[serde(default)]
    pub meeting_url: Option<String>,
    pub token: String,
    #[serde(deserialize_with = "string_or_number")]
    pub meeting_id: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default)]
    pub max_clients: Option<usize>,
    #[serde(default)]
    pub max_connection_time: Option<u64>,
    #[serde(default = "default_true")]
    pub use_vad: bool,
    #[serde(default)]
    pub initial_prompt: Option<String>,
}

fn default_task() -> String {
    "transcribe".into()
}

fn default_true() -> bool {
    true
}

/// Runtime control frames after the config frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SpeakerActivityUpdate {
        /// ISO-8601 timestamp the activity bits trail backwards from.
        timestamp: String,
        #[serde(default)]
        speakers: Vec<SpeakerActivityPayload>,
    },
    SessionControl {
        payload: SessionControlPayload,
    },
}

#[derive(Debug, Deserialize)]
pub struct SpeakerActivityPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mic_activity_bits: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionControlPayload {
    pub event: String,
}

/// The session-control event that starts a graceful drain.
pub const LEAVING_MEETING: &str = "LEAVING_MEETING";

// ─────────────────────────────────────────────────────────────────────────────
// Gateway WebSocket: gateway → bot
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Status {
        status: ServerStatus,
        uid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        backend: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<serde_json::Value>,
    },
    Segments {
        uid: String,
        segments: Vec<Segment>,
    },
    Language {
        uid: String,
        language: String,
        language_prob: f32,
    },
    Disconnect {
        uid: String,
        message: &'static str,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    ServerReady,
    Wait,
    Error,
}

impl ServerMessage {
    pub fn ready(uid: &str, backend: &str) -> Self {
        Self::Status {
            status: ServerStatus::ServerReady,
            uid: uid.to_string(),
            backend: Some(backend.to_string()),
            message: None,
        }
    }

    /// WAIT carries the estimated wait in minutes, as a number.
    pub fn wait(uid: &str, minutes: u64) -> Self {
        Self::Status {
            status: ServerStatus::Wait,
            uid: uid.to_string(),
            backend: None,
            message: Some(serde_json::json!(minutes)),
        }
    }

    pub fn error(uid: &str, message: &str) -> Self {
        Self::Status {
            status: ServerStatus::Error,
            uid: uid.to_string(),
            backend: None,
            message: Some(serde_json::json!(message)),
        }
    }

    pub fn disconnect(uid: &str) -> Self {
        Self::Disconnect {
            uid: uid.to_string(),
            message: "DISCONNECT",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound segment stream entries
// ─────────────────────────────────────────────────────────────────────────────

/// One JSON payload on the `transcription_segments` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEnvelope {
    SessionStart {
        uid: String,
        token: String,
        platform: String,
        #[serde(deserialize_with = "string_or_number")]
        meeting_id: String,
        /// ISO-8601 session start wall-clock time.
        start_timestamp: String,
    },
    Transcription {
        uid: String,
        token: String,
        platform: String,
        #[serde(deserialize_with = "string_or_number")]
        meeting_id: String,
        segments: Vec<Segment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    SessionEnd {
        uid: String,
        token: String,
        platform: String,
        #[serde(deserialize_with = "string_or_number")]
        meeting_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_accepts_numeric_meeting_id() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"uid":"s1","platform":"gm","meeting_id":42,"token":"T"}"#,
        )
        .unwrap();
        assert_eq!(cfg.meeting_id, "42");
        assert_eq!(cfg.task, "transcribe");
        assert!(cfg.use_vad);
    }

    #[test]
    fn session_config_rejects_missing_token() {
        let err = serde_json::from_str::<SessionConfig>(
            r#"{"uid":"s1","platform":"gm","meeting_id":"42"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn wait_message_carries_minutes_as_number() {
        let json = ServerMessage::wait("u1", 3).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "WAIT");
        assert_eq!(value["message"], 3);
    }

    #[test]
    fn control_message_parses_speaker_update() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"type":"speaker_activity_update","meeting_id":42,
                "timestamp":"2025-06-01T12:00:00Z",
                "speakers":[{"id":7,"name":"Ann","mic_activity_bits":"0110"}]}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::SpeakerActivityUpdate { speakers, .. } => {
                assert_eq!(speakers[0].id, "7");
                assert_eq!(speakers[0].mic_activity_bits, "0110");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn stream_envelope_round_trips_transcription() {
        let envelope = StreamEnvelope::Transcription {
            uid: "s1".into(),
            token: "T".into(),
            platform: "gm".into(),
            meeting_id: "42".into(),
            segments: vec![Segment::new(0.0, 4.0, "hello world.", true)],
            language: Some("en".into()),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"transcription""#));
        let back: StreamEnvelope = serde_json::from_str(&json).unwrap();
        match back {
            StreamEnvelope::Transcription { segments, .. } => {
                assert_eq!(segments[0].text, "hello world.");
                assert!(segments[0].completed);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }
}
