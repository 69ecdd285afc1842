//! Shared types for realtime streaming sessions.

use std::time::Duration;

use thiserror::Error;

use super::events::EventError;
use super::pool::PoolError;
use super::transport::TransportError;
use crate::core::audio::ogg::DEFAULT_MAX_BUFFER;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while opening or running a realtime session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// Pooled acquisition failed (cancelled, timed out, dial error).
    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    /// Socket-level failure while dialing, reading or writing.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error("Event codec error: {0}")]
    Event(#[from] EventError),

    /// The service finished the stream with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Dial was cancelled before the session opened.
    #[error("Session open cancelled")]
    Cancelled,
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Session Options
// =============================================================================

pub const DEFAULT_AUDIO_BUFFER: usize = 256;
pub const DEFAULT_PACKET_BUFFER: usize = 1024;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Per-session channel sizing and behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Depth of the audio channel.
    /// Default: 256
    pub audio_buffer: usize,

    /// Depth of the demuxed packet channel.
    /// Default: 1024
    pub packet_buffer: usize,

    /// Cap on bytes the demuxer keeps while waiting for a complete page.
    /// Default: 1 MiB
    pub demux_max_buffer: usize,

    /// Send `stop` once the text source is exhausted.
    /// Default: false
    pub auto_stop: bool,

    /// Keepalive ping period. `None` disables pings.
    /// Default: 15s
    pub ping_interval: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            audio_buffer: DEFAULT_AUDIO_BUFFER,
            packet_buffer: DEFAULT_PACKET_BUFFER,
            demux_max_buffer: DEFAULT_MAX_BUFFER,
            auto_stop: false,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
        }
    }
}
