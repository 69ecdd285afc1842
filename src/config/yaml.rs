use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use super::env::optional_secs;
use super::{ClientConfig, ConfigError};

/// Complete YAML configuration structure
///
/// All fields are optional; anything left out keeps the value from the
/// environment or the default.
///
/// # Example YAML structure
/// ```yaml
/// api_key: "your-api-key"
/// base_url: "https://api.fish.audio"
///
/// pool:
///   enabled: true
///   max_conns_per_key: 4
///   idle_ttl_secs: 60
///   max_life_secs: 600
///   text_idle_ttl_secs: 120
///   acquire_timeout_secs: 10
///
/// websocket:
///   handshake_timeout_secs: 15
///   read_timeout_secs: 30
///   ping_interval_secs: 15
///
/// session:
///   audio_buffer: 256
///   packet_buffer: 1024
///   demux_max_buffer: 1048576
///   auto_stop: false
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub pool: Option<PoolYaml>,
    pub websocket: Option<WebSocketYaml>,
    pub session: Option<SessionYaml>,
}

/// Connection pool configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PoolYaml {
    pub enabled: Option<bool>,
    pub max_conns_per_key: Option<usize>,
    pub idle_ttl_secs: Option<u64>,
    pub max_life_secs: Option<u64>,
    pub text_idle_ttl_secs: Option<u64>,
    /// 0 waits indefinitely
    pub acquire_timeout_secs: Option<u64>,
}

/// WebSocket configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WebSocketYaml {
    pub handshake_timeout_secs: Option<u64>,
    /// 0 disables the read deadline
    pub read_timeout_secs: Option<u64>,
    /// 0 disables keepalive pings
    pub ping_interval_secs: Option<u64>,
}

/// Session configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub audio_buffer: Option<usize>,
    pub packet_buffer: Option<usize>,
    pub demux_max_buffer: Option<usize>,
    pub auto_stop: Option<bool>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let config: YamlConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Overlays every value present in the file onto `config`.
    pub fn apply(self, config: &mut ClientConfig) {
        if let Some(key) = self.api_key {
            config.api_key = Zeroizing::new(key);
        }
        if let Some(url) = self.base_url {
            config.base_url = url;
        }

        if let Some(pool) = self.pool {
            if let Some(v) = pool.enabled {
                config.pooling = v;
            }
            if let Some(v) = pool.max_conns_per_key {
                config.max_conns_per_key = v;
            }
            if let Some(v) = pool.idle_ttl_secs {
                config.idle_ttl = Duration::from_secs(v);
            }
            if let Some(v) = pool.max_life_secs {
                config.max_life = Duration::from_secs(v);
            }
            if let Some(v) = pool.text_idle_ttl_secs {
                config.text_idle_ttl = Duration::from_secs(v);
            }
            if let Some(v) = pool.acquire_timeout_secs {
                config.acquire_timeout = optional_secs(v);
            }
        }

        if let Some(ws) = self.websocket {
            if let Some(v) = ws.handshake_timeout_secs {
                config.ws_handshake_timeout = Duration::from_secs(v);
            }
            if let Some(v) = ws.read_timeout_secs {
                config.ws_read_timeout = optional_secs(v);
            }
            if let Some(v) = ws.ping_interval_secs {
                config.ws_ping_interval = optional_secs(v);
            }
        }

        if let Some(session) = self.session {
            if let Some(v) = session.audio_buffer {
                config.audio_buffer = v;
            }
            if let Some(v) = session.packet_buffer {
                config.packet_buffer = v;
            }
            if let Some(v) = session.demux_max_buffer {
                config.demux_max_buffer = v;
            }
            if let Some(v) = session.auto_stop {
                config.auto_stop = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
api_key: "test-key"
base_url: "http://localhost:8080"
pool:
  enabled: false
  max_conns_per_key: 2
  idle_ttl_secs: 10
  max_life_secs: 20
  text_idle_ttl_secs: 30
  acquire_timeout_secs: 0
websocket:
  handshake_timeout_secs: 5
  read_timeout_secs: 0
  ping_interval_secs: 7
session:
  audio_buffer: 16
  packet_buffer: 32
  demux_max_buffer: 4096
  auto_stop: true
"#;
        let yaml_config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        let mut config = ClientConfig::default();
        config.acquire_timeout = Some(Duration::from_secs(99));
        yaml_config.apply(&mut config);

        assert_eq!(config.api_key.as_str(), "test-key");
        assert_eq!(config.base_url, "http://localhost:8080");
        assert!(!config.pooling);
        assert_eq!(config.max_conns_per_key, 2);
        assert_eq!(config.idle_ttl, Duration::from_secs(10));
        assert_eq!(config.max_life, Duration::from_secs(20));
        assert_eq!(config.text_idle_ttl, Duration::from_secs(30));
        assert_eq!(config.acquire_timeout, None);
        assert_eq!(config.ws_handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.ws_read_timeout, None);
        assert_eq!(config.ws_ping_interval, Some(Duration::from_secs(7)));
        assert_eq!(config.audio_buffer, 16);
        assert_eq!(config.packet_buffer, 32);
        assert_eq!(config.demux_max_buffer, 4096);
        assert!(config.auto_stop);
    }

    #[test]
    fn test_yaml_config_empty_keeps_values() {
        let yaml_config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        let mut config = ClientConfig::new("keep");
        yaml_config.apply(&mut config);
        assert_eq!(config.api_key.as_str(), "keep");
        assert_eq!(config.max_conns_per_key, 4);
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "pool:\n  max_conns_per_key: 3\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        assert_eq!(config.pool.unwrap().max_conns_per_key, Some(3));
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
