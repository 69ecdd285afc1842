use std::env;
use std::str::FromStr;
use std::time::Duration;

use zeroize::Zeroizing;

use super::{ClientConfig, ConfigError};

/// Overlays `FISH_*` environment variables onto `config`.
pub(super) fn apply_env(config: &mut ClientConfig) -> Result<(), ConfigError> {
    if let Some(key) = var("FISH_API_KEY") {
        config.api_key = Zeroizing::new(key);
    }
    if let Some(url) = var("FISH_BASE_URL") {
        config.base_url = url;
    }

    if let Some(v) = parse_bool("FISH_POOLING")? {
        config.pooling = v;
    }
    if let Some(v) = parse::<usize>("FISH_MAX_CONNS_PER_KEY")? {
        config.max_conns_per_key = v;
    }
    if let Some(v) = parse::<u64>("FISH_IDLE_TTL_SECS")? {
        config.idle_ttl = Duration::from_secs(v);
    }
    if let Some(v) = parse::<u64>("FISH_MAX_LIFE_SECS")? {
        config.max_life = Duration::from_secs(v);
    }
    if let Some(v) = parse::<u64>("FISH_TEXT_IDLE_TTL_SECS")? {
        config.text_idle_ttl = Duration::from_secs(v);
    }
    if let Some(v) = parse::<u64>("FISH_ACQUIRE_TIMEOUT_SECS")? {
        config.acquire_timeout = optional_secs(v);
    }

    if let Some(v) = parse::<u64>("FISH_WS_HANDSHAKE_TIMEOUT_SECS")? {
        config.ws_handshake_timeout = Duration::from_secs(v);
    }
    if let Some(v) = parse::<u64>("FISH_WS_READ_TIMEOUT_SECS")? {
        config.ws_read_timeout = optional_secs(v);
    }
    if let Some(v) = parse::<u64>("FISH_WS_PING_INTERVAL_SECS")? {
        config.ws_ping_interval = optional_secs(v);
    }

    if let Some(v) = parse::<usize>("FISH_AUDIO_BUFFER")? {
        config.audio_buffer = v;
    }
    if let Some(v) = parse::<usize>("FISH_PACKET_BUFFER")? {
        config.packet_buffer = v;
    }
    if let Some(v) = parse::<usize>("FISH_DEMUX_MAX_BUFFER")? {
        config.demux_max_buffer = v;
    }
    if let Some(v) = parse_bool("FISH_AUTO_STOP")? {
        config.auto_stop = v;
    }
    Ok(())
}

/// Zero disables the corresponding timer.
pub(super) fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    var(key)
        .map(|raw| raw.trim().parse::<T>().map_err(|_| invalid(key, &raw)))
        .transpose()
}

fn parse_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    var(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw)),
        })
        .transpose()
}
