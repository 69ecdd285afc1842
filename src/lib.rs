pub mod client;
pub mod config;
pub mod core;
pub mod errors;

// Re-export commonly used items for convenience
pub use client::{Client, DEFAULT_BACKEND, live_url};
pub use config::{ClientConfig, ConfigError};
pub use core::*;
pub use crate::core::audio::OggDemuxer;
pub use crate::core::realtime::{RealtimeError, RealtimeSession, SessionController, SessionOptions};
pub use crate::core::tts::{AudioFormat, LatencyMode, Prosody, TtsRequest};
pub use errors::{ClientError, ClientResult};
