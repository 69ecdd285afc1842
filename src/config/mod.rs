//! Client configuration.
//!
//! Configuration comes from YAML files, environment variables (including a
//! `.env` file loaded by the binary) and built-in defaults.
//! Priority: YAML > ENV vars > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//!
//! # Example
//! ```rust,no_run
//! use fishaudio_client::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Environment only
//! let config = ClientConfig::from_env()?;
//!
//! // YAML file on top of the environment
//! let config = ClientConfig::from_file(&PathBuf::from("fishaudio.yaml"))?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;
use zeroize::Zeroizing;

use crate::core::audio::ogg::DEFAULT_MAX_BUFFER;
use crate::core::realtime::{
    DEFAULT_AUDIO_BUFFER, DEFAULT_PACKET_BUFFER, DEFAULT_PING_INTERVAL, PoolConfig,
    SessionOptions, TransportOptions,
};

mod env;
mod yaml;

pub use yaml::YamlConfig;

/// Default service endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.fish.audio";

/// Configuration loading and validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse YAML config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("API key is required (set FISH_API_KEY or api_key)")]
    MissingApiKey,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a [`Client`](crate::Client) needs to talk to the service.
#[derive(Clone)]
pub struct ClientConfig {
    /// Bearer token. Zeroized on drop.
    pub api_key: Zeroizing<String>,
    /// Default: https://api.fish.audio
    pub base_url: String,

    // Pool
    /// Reuse realtime connections across sessions.
    /// Default: true
    pub pooling: bool,
    /// Default: 4
    pub max_conns_per_key: usize,
    /// Default: 60s
    pub idle_ttl: Duration,
    /// Default: 10 min
    pub max_life: Duration,
    /// Default: 2 min
    pub text_idle_ttl: Duration,
    /// Default: None (wait indefinitely)
    pub acquire_timeout: Option<Duration>,

    // WebSocket
    /// Default: 15s
    pub ws_handshake_timeout: Duration,
    /// Default: 30s. `None` disables the read deadline.
    pub ws_read_timeout: Option<Duration>,
    /// Default: 15s. `None` disables keepalive pings.
    pub ws_ping_interval: Option<Duration>,

    // Session
    /// Default: 256
    pub audio_buffer: usize,
    /// Default: 1024
    pub packet_buffer: usize,
    /// Default: 1 MiB
    pub demux_max_buffer: usize,
    /// Default: false
    pub auto_stop: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        let transport = TransportOptions::default();
        Self {
            api_key: Zeroizing::new(String::new()),
            base_url: DEFAULT_BASE_URL.to_string(),
            pooling: true,
            max_conns_per_key: pool.max_per_key,
            idle_ttl: pool.idle_ttl,
            max_life: pool.max_life,
            text_idle_ttl: pool.text_idle_ttl,
            acquire_timeout: None,
            ws_handshake_timeout: transport.handshake_timeout,
            ws_read_timeout: transport.read_timeout,
            ws_ping_interval: Some(DEFAULT_PING_INTERVAL),
            audio_buffer: DEFAULT_AUDIO_BUFFER,
            packet_buffer: DEFAULT_PACKET_BUFFER,
            demux_max_buffer: DEFAULT_MAX_BUFFER,
            auto_stop: false,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("pooling", &self.pooling)
            .field("max_conns_per_key", &self.max_conns_per_key)
            .field("idle_ttl", &self.idle_ttl)
            .field("max_life", &self.max_life)
            .field("text_idle_ttl", &self.text_idle_ttl)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("ws_handshake_timeout", &self.ws_handshake_timeout)
            .field("ws_read_timeout", &self.ws_read_timeout)
            .field("ws_ping_interval", &self.ws_ping_interval)
            .field("audio_buffer", &self.audio_buffer)
            .field("packet_buffer", &self.packet_buffer)
            .field("demux_max_buffer", &self.demux_max_buffer)
            .field("auto_stop", &self.auto_stop)
            .finish()
    }
}

impl ClientConfig {
    /// Defaults with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Zeroizing::new(api_key.into()),
            ..Default::default()
        }
    }

    /// Loads from environment variables over defaults, then validates.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        env::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file over environment variables over defaults, then
    /// validates.
    ///
    /// Note: `.env` is loaded by the binary at startup, so its values are
    /// already part of the environment here.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml_config = YamlConfig::from_file(path)?;
        let mut config = Self::default();
        env::apply_env(&mut config)?;
        yaml_config.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        let url = Url::parse(&self.base_url).map_err(|e| {
            ConfigError::Invalid(format!("base_url '{}' is not a valid URL: {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "base_url must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.max_conns_per_key == 0 {
            return Err(ConfigError::Invalid(
                "max_conns_per_key must be at least 1".to_string(),
            ));
        }
        if self.audio_buffer == 0 || self.packet_buffer == 0 {
            return Err(ConfigError::Invalid(
                "audio_buffer and packet_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_per_key: self.max_conns_per_key,
            idle_ttl: self.idle_ttl,
            max_life: self.max_life,
            text_idle_ttl: self.text_idle_ttl,
            acquire_timeout: self.acquire_timeout,
            ..Default::default()
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            handshake_timeout: self.ws_handshake_timeout,
            read_timeout: self.ws_read_timeout,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            audio_buffer: self.audio_buffer,
            packet_buffer: self.packet_buffer,
            demux_max_buffer: self.demux_max_buffer,
            auto_stop: self.auto_stop,
            ping_interval: self.ws_ping_interval,
        }
    }
}
