//! Media-stream frame schema for the telephony WebSocket.
//!
//! The platform opens a socket against `/media` and exchanges JSON frames
//! tagged by an `event` field. Audio rides in `media` frames as base64
//! G.711 mu-law at 8 kHz; everything else is control. Unknown extra fields
//! (sequence numbers, account ids) are ignored on parse.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One frame on the media stream, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamFrame {
    /// Socket-level hello, sent once before `start`.
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// Stream metadata; binds the socket to a call.
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMeta,
    },
    /// Audio payload. Outbound frames carry the stream sid; inbound ones
    /// may omit it.
    Media {
        #[serde(rename = "streamSid", default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    /// End of stream from the platform side.
    Stop {
        #[serde(rename = "streamSid", default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },
    /// Playback checkpoint echo.
    Mark {
        #[serde(rename = "streamSid", default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        mark: MarkLabel,
    },
    /// Tells the platform to drop any buffered outbound audio.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid")]
    pub call_sid: String,
    /// Parameters attached by the stream verb; carries our call id.
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(rename = "mediaFormat", default, skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Base64 G.711 mu-law audio, forwarded without re-framing.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkLabel {
    pub name: String,
}

impl StreamFrame {
    pub fn parse(text: &str) -> Result<StreamFrame, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Outbound audio frame constructor.
    pub fn media_out(stream_sid: &str, payload_b64: String) -> StreamFrame {
        StreamFrame::Media {
            stream_sid: Some(stream_sid.to_string()),
            media: MediaPayload {
                track: Some("outbound".into()),
                chunk: None,
                timestamp: None,
                payload: payload_b64,
            },
        }
    }

    pub fn clear(stream_sid: &str) -> StreamFrame {
        StreamFrame::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    /// The orchestrator call id bound to a `start` frame: the custom
    /// `call_id` parameter when present, otherwise the platform call sid.
    pub fn bound_call_id(&self) -> Option<&str> {
        match self {
            StreamFrame::Start { start, .. } => Some(
                start
                    .custom_parameters
                    .get("call_id")
                    .map(String::as_str)
                    .unwrap_or(start.call_sid.as_str()),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_platform_start_frame() {
        let raw = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ123",
            "start": {
                "streamSid": "MZ123",
                "accountSid": "AC999",
                "callSid": "CA777",
                "tracks": ["inbound"],
                "customParameters": {"call_id": "CA777"},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        let frame = StreamFrame::parse(raw).unwrap();
        match &frame {
            StreamFrame::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA777");
                assert_eq!(
                    start.media_format.as_ref().unwrap().sample_rate,
                    8000
                );
            }
            other => panic!("expected start frame, got {other:?}"),
        }
        assert_eq!(frame.bound_call_id(), Some("CA777"));
    }

    #[test]
    fn start_without_custom_parameter_falls_back_to_call_sid() {
        let raw = r#"{
            "event": "start",
            "streamSid": "MZ1",
            "start": {"streamSid": "MZ1", "callSid": "CA42"}
        }"#;
        let frame = StreamFrame::parse(raw).unwrap();
        assert_eq!(frame.bound_call_id(), Some("CA42"));
    }

    #[test]
    fn parses_media_frame() {
        let raw = r#"{
            "event": "media",
            "sequenceNumber": "3",
            "streamSid": "MZ123",
            "media": {"track": "inbound", "chunk": "2", "timestamp": "160", "payload": "dGVzdA=="}
        }"#;
        match StreamFrame::parse(raw).unwrap() {
            StreamFrame::Media { media, .. } => assert_eq!(media.payload, "dGVzdA=="),
            other => panic!("expected media frame, got {other:?}"),
        }
    }

    #[test]
    fn parses_connected_and_stop() {
        let connected = StreamFrame::parse(
            r#"{"event": "connected", "protocol": "Call", "version": "1.0.0"}"#,
        )
        .unwrap();
        assert!(matches!(connected, StreamFrame::Connected { .. }));

        let stop =
            StreamFrame::parse(r#"{"event": "stop", "streamSid": "MZ123", "stop": {}}"#).unwrap();
        assert!(matches!(stop, StreamFrame::Stop { .. }));
    }

    #[test]
    fn outbound_media_serializes_with_event_tag() {
        let json = StreamFrame::media_out("MZ5", "YWJj".into()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ5");
        assert_eq!(value["media"]["payload"], "YWJj");
    }

    #[test]
    fn clear_frame_serializes() {
        let json = StreamFrame::clear("MZ5").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "clear");
        assert_eq!(value["streamSid"], "MZ5");
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(StreamFrame::parse("not json").is_err());
        assert!(StreamFrame::parse(r#"{"event": "warp"}"#).is_err());
    }

    #[test]
    fn mark_echo_round_trips() {
        let raw = r#"{"event": "mark", "streamSid": "MZ1", "mark": {"name": "greeting-done"}}"#;
        match StreamFrame::parse(raw).unwrap() {
            StreamFrame::Mark { mark, .. } => assert_eq!(mark.name, "greeting-done"),
            other => panic!("expected mark frame, got {other:?}"),
        }
    }
}
