//! Server configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes. Command-line flags in `main.rs` are applied on top of whatever
//! the file provides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::link::LinkConfig;
use shared::session::{DEFAULT_REKEY_BYTES, RekeyPolicy};
use shared::{DEFAULT_PORT, MAX_PACKET_SIZE};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_packet_size: usize,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Process loop ticks per second.
    pub tick_rate: u32,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connecting_timeout_ms: u64,
    pub max_connections: usize,
    pub max_connections_per_address: usize,
    pub rekey_bytes: u64,
    pub rekey_interval_secs: u64,
    pub blacklist_ttl_secs: u64,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: f64,
    pub token_ttl_secs: u64,
    pub reliable_resend_ms: u64,
    pub reliable_max_attempts: u32,
    /// Datagrams the send task drains per wakeup.
    pub send_batch_size: usize,
    pub sweep_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_packet_size: MAX_PACKET_SIZE,
            recv_buffer_size: 512 * 1024,
            send_buffer_size: 512 * 1024,
            tick_rate: 60,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 30_000,
            connecting_timeout_ms: 3_000,
            max_connections: 25_000,
            max_connections_per_address: 4,
            rekey_bytes: DEFAULT_REKEY_BYTES,
            rekey_interval_secs: 60 * 60,
            blacklist_ttl_secs: 30,
            rate_limit_per_second: 60.0,
            rate_limit_burst: 5.0,
            token_ttl_secs: 10,
            reliable_resend_ms: 250,
            reliable_max_attempts: 10,
            send_batch_size: 64,
            sweep_interval_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Loads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be positive"));
        }
        if self.max_packet_size < 64 || self.max_packet_size > 65_507 {
            return Err(ConfigError::Invalid(
                "max_packet_size must be between 64 and 65507",
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must exceed a non-zero heartbeat_interval_ms",
            ));
        }
        if self.max_connections == 0 || self.max_connections_per_address == 0 {
            return Err(ConfigError::Invalid("connection limits must be positive"));
        }
        if self.rate_limit_per_second <= 0.0 || self.rate_limit_burst < 0.0 {
            return Err(ConfigError::Invalid(
                "rate_limit_per_second must be positive and rate_limit_burst non-negative",
            ));
        }
        if self.reliable_max_attempts == 0 || self.send_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "reliable_max_attempts and send_batch_size must be positive",
            ));
        }
        if self.token_ttl_secs == 0 || self.rekey_bytes == 0 || self.rekey_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "token and rekey thresholds must be positive",
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_millis(self.connecting_timeout_ms)
    }

    pub fn blacklist_ttl(&self) -> Duration {
        Duration::from_secs(self.blacklist_ttl_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn rekey_policy(&self) -> RekeyPolicy {
        RekeyPolicy {
            max_bytes: self.rekey_bytes,
            max_age: Duration::from_secs(self.rekey_interval_secs),
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            resend_interval: Duration::from_millis(self.reliable_resend_ms),
            max_attempts: self.reliable_max_attempts,
            rekey: self.rekey_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_packet_size, 1200);
        assert_eq!(config.rekey_bytes, 1 << 30);
        assert_eq!(config.blacklist_ttl(), Duration::from_secs(30));
        assert_eq!(config.token_ttl(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "port": 9000, "tick_rate": 30 }"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.max_connections, 25_000);
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ServerConfig::default();
        config.tick_rate = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServerConfig::default();
        config.heartbeat_timeout_ms = config.heartbeat_interval_ms;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.rate_limit_per_second = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("server-config-{}.json", std::process::id()));
        {
            let mut file = fs::File::create(&path).unwrap();
            write!(file, r#"{{ "host": "0.0.0.0", "max_connections_per_address": 2 }}"#).unwrap();
        }
        let config = ServerConfig::from_file(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_connections_per_address, 2);
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            ServerConfig::from_file("/nonexistent/server.json"),
            Err(ConfigError::Io(_))
        ));

        let path = std::env::temp_dir().join(format!("server-config-bad-{}.json", std::process::id()));
        fs::write(&path, "{ not json").unwrap();
        let result = ServerConfig::from_file(&path);
        fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_link_config_from_settings() {
        let config = ServerConfig::default();
        let link = config.link_config();
        assert_eq!(link.resend_interval, Duration::from_millis(250));
        assert_eq!(link.max_attempts, 10);
        assert_eq!(link.rekey.max_age, Duration::from_secs(3600));
    }

    #[test]
    fn test_tick_duration() {
        let mut config = ServerConfig::default();
        config.tick_rate = 50;
        assert_eq!(config.tick_duration(), Duration::from_millis(20));
    }
}
