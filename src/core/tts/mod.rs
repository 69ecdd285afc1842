//! Synthesis request model and the one-shot HTTP conversion.

pub mod convert;
pub mod messages;

pub use convert::{CONVERT_PATH, build_convert_request};
pub use messages::{AudioFormat, LatencyMode, Prosody, TtsRequest};
