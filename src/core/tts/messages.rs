//! Fish Audio request descriptor.
//!
//! The same descriptor is sent as the MessagePack body of a one-shot
//! `POST /v1/tts` call and as the payload of the realtime `start` event.
//! Every field except `text` is optional and omitted from the wire when unset.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Enums
// =============================================================================

/// Output audio container/codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Pcm,
    #[default]
    Mp3,
    /// Ogg-encapsulated Opus. Realtime sessions demux this into packets.
    Opus,
}

impl AudioFormat {
    /// Wire name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Pcm => "pcm",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
        }
    }

    /// Whether realtime audio in this format is split into Ogg packets.
    #[inline]
    pub fn requires_demux(&self) -> bool {
        matches!(self, Self::Opus)
    }

    /// Conventional file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Opus => "ogg",
            other => other.as_str(),
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "pcm" => Ok(Self::Pcm),
            "mp3" => Ok(Self::Mp3),
            "opus" | "ogg" => Ok(Self::Opus),
            other => Err(format!("unsupported audio format '{other}'")),
        }
    }
}

/// Latency/quality trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMode {
    #[default]
    Normal,
    Balanced,
}

impl FromStr for LatencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "balanced" => Ok(Self::Balanced),
            other => Err(format!("unsupported latency mode '{other}'")),
        }
    }
}

// =============================================================================
// Request
// =============================================================================

/// Speaking rate and loudness adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Prosody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
}

/// Synthesis request.
///
/// For realtime sessions `text` is usually empty: the text arrives as a
/// stream of fragments after the `start` event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Voice model to speak with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prosody: Option<Prosody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_length: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<AudioFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mp3_bitrate: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opus_bitrate: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyMode>,
}

impl TtsRequest {
    /// Creates a request for `text` with every option unset.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_latency(mut self, latency: LatencyMode) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Whether realtime audio for this request should be demuxed into packets.
    pub fn requires_demux(&self) -> bool {
        self.format.is_some_and(|f| f.requires_demux())
    }

    /// Encodes the request as a MessagePack map.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_parse_is_case_insensitive() {
        assert_eq!("OPUS".parse::<AudioFormat>(), Ok(AudioFormat::Opus));
        assert_eq!(" Mp3 ".parse::<AudioFormat>(), Ok(AudioFormat::Mp3));
        assert!("flac".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn test_requires_demux_only_for_opus() {
        assert!(TtsRequest::new("").with_format(AudioFormat::Opus).requires_demux());
        assert!(!TtsRequest::new("").with_format(AudioFormat::Wav).requires_demux());
        assert!(!TtsRequest::new("").requires_demux());
    }

    #[test]
    fn test_msgpack_omits_unset_fields() {
        let request = TtsRequest::new("hello")
            .with_format(AudioFormat::Opus)
            .with_reference_id("voice-1");
        let encoded = request.to_msgpack().unwrap();

        let value: serde_json::Value = rmp_serde::from_slice(&encoded).unwrap();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["text"], "hello");
        assert_eq!(map["format"], "opus");
        assert_eq!(map["reference_id"], "voice-1");

        let decoded: TtsRequest = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_prosody_nested_map() {
        let mut request = TtsRequest::new("x").with_latency(LatencyMode::Balanced);
        request.prosody = Some(Prosody {
            speed: Some(1.25),
            volume: None,
        });
        let value: serde_json::Value =
            rmp_serde::from_slice(&request.to_msgpack().unwrap()).unwrap();
        assert_eq!(value["latency"], "balanced");
        assert_eq!(value["prosody"]["speed"], 1.25);
        assert!(value["prosody"].get("volume").is_none());
    }
}
