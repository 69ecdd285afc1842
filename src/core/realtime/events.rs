//! Realtime event codec.
//!
//! Every frame on the live socket is one MessagePack map carrying an `event`
//! tag. Outbound frames are [`ClientEvent`]s; inbound frames decode into the
//! closed [`ServerEvent`] set, and an unknown tag is a decode error.
//!
//! ```text
//! client -> server   {event:"start", request:{...}}
//!                    {event:"text", text:"..."}
//!                    {event:"flush"}
//!                    {event:"stop"}
//! server -> client   {event:"audio", audio:<bin>}
//!                    {event:"finish", reason:"stop"|"error", message?:"..."}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::tts::TtsRequest;

/// Errors produced while encoding or decoding realtime frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Failed to encode event: {0}")]
    Encode(String),

    #[error("Failed to decode event: {0}")]
    Decode(String),

    #[error("Unknown event type: {0}")]
    UnknownEvent(String),
}

// =============================================================================
// Outbound
// =============================================================================

/// Event sent from the client to the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientEvent {
    /// Opens a synthesis stream with the full request descriptor.
    Start { request: TtsRequest },
    /// Appends a text fragment.
    Text { text: String },
    /// Asks the service to synthesize everything buffered so far.
    Flush,
    /// Ends the stream; the service answers with `finish`.
    Stop,
}

impl ClientEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Wire tag of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Text { .. } => "text",
            Self::Flush => "flush",
            Self::Stop => "stop",
        }
    }

    /// Encodes the event as a MessagePack map.
    pub fn encode(&self) -> Result<Bytes, EventError> {
        rmp_serde::to_vec_named(self)
            .map(Bytes::from)
            .map_err(|e| EventError::Encode(e.to_string()))
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Reason carried by a `finish` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Error,
    Other(String),
}

impl FinishReason {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("stop") | None => Self::Stop,
            Some("error") => Self::Error,
            Some(other) => Self::Other(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

/// Event received from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A chunk of encoded audio in the negotiated format.
    Audio(Bytes),
    /// End of the stream.
    Finish {
        reason: FinishReason,
        message: Option<String>,
    },
}

/// Raw inbound map before it is narrowed into a [`ServerEvent`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerFrame {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    audio: Option<Bytes>,
}

impl ServerEvent {
    /// Decodes one inbound frame.
    pub fn decode(frame: &[u8]) -> Result<Self, EventError> {
        let raw: ServerFrame =
            rmp_serde::from_slice(frame).map_err(|e| EventError::Decode(e.to_string()))?;
        match raw.event.as_str() {
            "audio" => Ok(Self::Audio(raw.audio.unwrap_or_default())),
            "finish" => Ok(Self::Finish {
                reason: FinishReason::parse(raw.reason.as_deref()),
                message: raw.message,
            }),
            _ => Err(EventError::UnknownEvent(raw.event)),
        }
    }

    /// Encodes the event in the service's wire shape.
    pub fn encode(&self) -> Result<Bytes, EventError> {
        let frame = match self {
            Self::Audio(audio) => ServerFrame {
                event: "audio".to_string(),
                audio: Some(audio.clone()),
                ..Default::default()
            },
            Self::Finish { reason, message } => ServerFrame {
                event: "finish".to_string(),
                reason: Some(reason.as_str().to_string()),
                message: message.clone(),
                ..Default::default()
            },
        };
        rmp_serde::to_vec_named(&frame)
            .map(Bytes::from)
            .map_err(|e| EventError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tts::AudioFormat;
    use serde_json::Value;

    fn as_json(bytes: &[u8]) -> Value {
        rmp_serde::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_client_events_are_tagged_maps() {
        assert_eq!(
            as_json(&ClientEvent::text("hi").encode().unwrap()),
            serde_json::json!({"event": "text", "text": "hi"})
        );
        assert_eq!(
            as_json(&ClientEvent::Flush.encode().unwrap()),
            serde_json::json!({"event": "flush"})
        );
        assert_eq!(
            as_json(&ClientEvent::Stop.encode().unwrap()),
            serde_json::json!({"event": "stop"})
        );
    }

    #[test]
    fn test_start_carries_request() {
        let request = TtsRequest::new("").with_format(AudioFormat::Opus);
        let value = as_json(&ClientEvent::Start { request }.encode().unwrap());
        assert_eq!(value["event"], "start");
        assert_eq!(value["request"]["format"], "opus");
        assert_eq!(value["request"]["text"], "");
    }

    #[test]
    fn test_decode_audio_frame() {
        let frame = ServerEvent::Audio(Bytes::from_static(b"\x00\x01OggS"))
            .encode()
            .unwrap();
        assert_eq!(
            ServerEvent::decode(&frame).unwrap(),
            ServerEvent::Audio(Bytes::from_static(b"\x00\x01OggS"))
        );
    }

    #[test]
    fn test_decode_audio_without_payload_is_empty() {
        let frame = rmp_serde::to_vec_named(&ServerFrame {
            event: "audio".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            ServerEvent::decode(&frame).unwrap(),
            ServerEvent::Audio(Bytes::new())
        );
    }

    #[test]
    fn test_decode_finish_reasons() {
        let frame = ServerEvent::Finish {
            reason: FinishReason::Error,
            message: Some("quota exceeded".to_string()),
        }
        .encode()
        .unwrap();
        match ServerEvent::decode(&frame).unwrap() {
            ServerEvent::Finish { reason, message } => {
                assert!(reason.is_error());
                assert_eq!(message.as_deref(), Some("quota exceeded"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let frame = rmp_serde::to_vec_named(&ServerFrame {
            event: "finish".to_string(),
            reason: Some("timeout".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            ServerEvent::decode(&frame).unwrap(),
            ServerEvent::Finish {
                reason: FinishReason::Other("timeout".to_string()),
                message: None,
            }
        );
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let frame = rmp_serde::to_vec_named(&ServerFrame {
            event: "log".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            ServerEvent::decode(&frame),
            Err(EventError::UnknownEvent("log".to_string()))
        );
    }

    #[test]
    fn test_malformed_frame_is_decode_error() {
        assert!(matches!(
            ServerEvent::decode(b"\xc1\xff\x00"),
            Err(EventError::Decode(_))
        ));
    }
}
