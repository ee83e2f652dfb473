//! # Voice Socket Wire Protocol
//!
//! ## Client → Server (text frames)
//! - Event variant: `{"event": "start_listening" | "stop_listening" | "start_speaking" | "ping", ...}`
//! - Chunk variant: `{"type": "audio_chunk" | "configure" | "interrupt" | "ping", ...}`
//!
//! ## Client → Server (binary frames)
//! Raw mono PCM16 audio for the current turn.
//!
//! ## Server → Client
//! JSON text frames tagged by `event`, plus binary frames of synthesized audio
//! delivered between `speech_start` and `speech_end`.

use crate::audio::segmenter::{SegmenterConfig, SegmenterUpdate, VoiceActivityState};
use crate::services::recognizer::TranscriptionResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch with millisecond precision.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Control events of the event-tagged variant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    StartListening,
    StopListening,
    StartSpeaking {
        text: String,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<f64>,
    },
}

/// Messages of the chunk-oriented variant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkMessage {
    AudioChunk {
        /// Base64 encoded PCM16
        data: String,
        #[serde(default)]
        timestamp: Option<f64>,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        is_last: bool,
    },
    Configure {
        #[serde(default)]
        config: SegmenterUpdate,
    },
    Interrupt,
    Ping {
        #[serde(default)]
        timestamp: Option<f64>,
    },
}

/// A parsed client text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Event(ClientEvent),
    Chunk(ChunkMessage),
    /// Well-formed JSON naming an event or type this server does not know
    Unknown(String),
}

/// Parse a client text frame.
///
/// Unknown event names are returned as `Unknown` rather than an error so newer
/// clients keep working against older servers.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if let Some(name) = value.get("event").and_then(|v| v.as_str()) {
        return match serde_json::from_value::<ClientEvent>(value.clone()) {
            Ok(event) => Ok(InboundMessage::Event(event)),
            Err(_) if !is_known_event(name) => Ok(InboundMessage::Unknown(name.to_string())),
            Err(e) => Err(e),
        };
    }

    if let Some(name) = value.get("type").and_then(|v| v.as_str()) {
        return match serde_json::from_value::<ChunkMessage>(value.clone()) {
            Ok(message) => Ok(InboundMessage::Chunk(message)),
            Err(_) if !is_known_type(name) => Ok(InboundMessage::Unknown(name.to_string())),
            Err(e) => Err(e),
        };
    }

    Ok(InboundMessage::Unknown(String::new()))
}

fn is_known_event(name: &str) -> bool {
    matches!(name, "start_listening" | "stop_listening" | "start_speaking" | "ping")
}

fn is_known_type(name: &str) -> bool {
    matches!(name, "audio_chunk" | "configure" | "interrupt" | "ping")
}

/// Events the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        session_id: String,
        state: VoiceActivityState,
    },
    ListeningStarted,
    ListeningStopped,
    StateChange {
        state: VoiceActivityState,
    },
    SpeechStart {
        text: String,
    },
    SpeechEnd {
        interrupted: bool,
    },
    PartialTranscript(TranscriptionResult),
    FinalTranscript(TranscriptionResult),
    AssistantText {
        text: String,
    },
    InterviewCompleted {
        message: String,
    },
    Configured {
        config: SegmenterConfig,
    },
    Interrupted,
    Error {
        message: String,
    },
    Pong {
        timestamp: f64,
    },
    Ping {
        timestamp: f64,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "event": "error", "message": e.to_string() }).to_string()
        })
    }

    pub fn into_frame(self) -> OutboundFrame {
        OutboundFrame::Text(self.to_json())
    }
}

/// One item on a session's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_variant() {
        assert_eq!(
            parse_inbound(r#"{"event": "start_listening"}"#).unwrap(),
            InboundMessage::Event(ClientEvent::StartListening)
        );
        assert_eq!(
            parse_inbound(r#"{"event": "start_speaking", "text": "Hello"}"#).unwrap(),
            InboundMessage::Event(ClientEvent::StartSpeaking {
                text: "Hello".to_string()
            })
        );
        assert_eq!(
            parse_inbound(r#"{"event": "ping"}"#).unwrap(),
            InboundMessage::Event(ClientEvent::Ping { timestamp: None })
        );
    }

    #[test]
    fn test_parse_chunk_variant() {
        let message = parse_inbound(
            r#"{"type": "audio_chunk", "data": "AAA=", "timestamp": 1.5, "sample_rate": 16000}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            InboundMessage::Chunk(ChunkMessage::AudioChunk {
                data: "AAA=".to_string(),
                timestamp: Some(1.5),
                sample_rate: Some(16000),
                is_last: false,
            })
        );

        let configure =
            parse_inbound(r#"{"type": "configure", "config": {"silence_timeout": 1.0}}"#).unwrap();
        match configure {
            InboundMessage::Chunk(ChunkMessage::Configure { config }) => {
                assert_eq!(config.silence_timeout, Some(1.0));
                assert_eq!(config.threshold, None);
            }
            other => panic!("unexpected message {:?}", other),
        }

        assert_eq!(
            parse_inbound(r#"{"type": "interrupt"}"#).unwrap(),
            InboundMessage::Chunk(ChunkMessage::Interrupt)
        );
    }

    #[test]
    fn test_unknown_events_are_not_errors() {
        assert_eq!(
            parse_inbound(r#"{"event": "dance"}"#).unwrap(),
            InboundMessage::Unknown("dance".to_string())
        );
        assert_eq!(
            parse_inbound(r#"{"type": "telemetry", "x": 1}"#).unwrap(),
            InboundMessage::Unknown("telemetry".to_string())
        );
    }

    #[test]
    fn test_malformed_known_event_is_an_error() {
        // start_speaking requires text
        assert!(parse_inbound(r#"{"event": "start_speaking"}"#).is_err());
        assert!(parse_inbound("not json").is_err());
    }

    #[test]
    fn test_server_event_serialization() {
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::ListeningStarted.to_json()).unwrap();
        assert_eq!(json["event"], "listening_started");

        let result = TranscriptionResult::new("hello world", 0.9, 1.0).with_final(true);
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::FinalTranscript(result).to_json()).unwrap();
        assert_eq!(json["event"], "final_transcript");
        assert_eq!(json["text"], "hello world");
        assert_eq!(json["is_final"], true);
        assert_eq!(json["word_count"], 2);

        let json: serde_json::Value = serde_json::from_str(
            &ServerEvent::StateChange {
                state: VoiceActivityState::Speech,
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(json["state"], "speech");

        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::error("boom").to_json()).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["message"], "boom");
    }
}
