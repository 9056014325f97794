//! # Configuration Management
//!
//! Centralized configuration for the session transport.
//!
//! This module provides structured configuration for the acceptor and for
//! client connections: endpoints, connection limits, timeouts, framing
//! limits and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - Environment variables (`MOG_SESSION_*`) via `from_env()`
//! - Direct instantiation with defaults
//!
//! ## Timeouts
//! The wire protocol has no timers of its own. Connect and handshake waits
//! are bounded here; `None` means wait indefinitely.

use crate::core::frame::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default game server port
pub const DEFAULT_PORT: u16 = 27015;

/// Default bound on resolve + connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the authentication exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a logged-out session keeps reading before dropping the socket
pub const DEFAULT_LOGOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Acceptor configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client connection configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Framing configuration shared by both roles
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults.
    ///
    /// Recognised: `MOG_SESSION_SERVER_ADDRESS`, `MOG_SESSION_SERVER_PORT`,
    /// `MOG_SESSION_ENABLE_IPV6`, `MOG_SESSION_MAX_CONNECTIONS`,
    /// `MOG_SESSION_CONNECT_TIMEOUT_MS`, `MOG_SESSION_HANDSHAKE_TIMEOUT_MS`
    /// (0 disables), `MOG_SESSION_LOG_LEVEL`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{value}'")))
        }

        let mut config = Self::default();

        if let Some(addr) = lookup("MOG_SESSION_SERVER_ADDRESS") {
            config.server.address = parse("MOG_SESSION_SERVER_ADDRESS", &addr)?;
        }

        if let Some(port) = lookup("MOG_SESSION_SERVER_PORT") {
            config.server.port = parse("MOG_SESSION_SERVER_PORT", &port)?;
        }

        if let Some(flag) = lookup("MOG_SESSION_ENABLE_IPV6") {
            config.server.enable_ipv6 = parse("MOG_SESSION_ENABLE_IPV6", &flag)?;
        }

        if let Some(max) = lookup("MOG_SESSION_MAX_CONNECTIONS") {
            config.server.max_connections = parse("MOG_SESSION_MAX_CONNECTIONS", &max)?;
        }

        if let Some(ms) = lookup("MOG_SESSION_CONNECT_TIMEOUT_MS") {
            let ms: u64 = parse("MOG_SESSION_CONNECT_TIMEOUT_MS", &ms)?;
            config.client.connect_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(ms) = lookup("MOG_SESSION_HANDSHAKE_TIMEOUT_MS") {
            let ms: u64 = parse("MOG_SESSION_HANDSHAKE_TIMEOUT_MS", &ms)?;
            let timeout = (ms > 0).then(|| Duration::from_millis(ms));
            config.server.handshake_timeout = timeout;
            config.client.handshake_timeout = timeout;
        }

        if let Some(level) = lookup("MOG_SESSION_LOG_LEVEL") {
            config.logging.log_level = parse("MOG_SESSION_LOG_LEVEL", &level)?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Acceptor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// IPv4 listen address; the IPv6 instance always binds the unspecified address
    pub address: Ipv4Addr,

    /// Listen port, shared by both address families
    pub port: u16,

    /// Also listen on IPv6 when the host supports it
    pub enable_ipv6: bool,

    /// Maximum number of concurrent sessions
    pub max_connections: usize,

    /// Bound on the authentication exchange of an accepted session
    #[serde(default, with = "option_duration_serde")]
    pub handshake_timeout: Option<Duration>,

    /// How long a session keeps reading after logout before closing
    #[serde(with = "duration_serde")]
    pub logout_drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            enable_ipv6: true,
            max_connections: 1000,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            logout_drain_timeout: DEFAULT_LOGOUT_DRAIN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if let Some(timeout) = self.handshake_timeout {
            if timeout.as_millis() < 100 {
                errors.push("Server handshake timeout too short (minimum: 100ms)".to_string());
            } else if timeout.as_secs() > 300 {
                errors.push("Server handshake timeout too long (maximum: 300s)".to_string());
            }
        }

        if self.logout_drain_timeout.as_secs() > 60 {
            errors.push("Logout drain timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Bound on hostname resolution plus connecting
    #[serde(default, with = "option_duration_serde")]
    pub connect_timeout: Option<Duration>,

    /// Bound on the authentication exchange
    #[serde(default, with = "option_duration_serde")]
    pub handshake_timeout: Option<Duration>,

    /// How long a session keeps reading after logout before closing
    #[serde(with = "duration_serde")]
    pub logout_drain_timeout: Duration,

    /// Set TCP_NODELAY on connected sockets
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            logout_drain_timeout: DEFAULT_LOGOUT_DRAIN_TIMEOUT,
            nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(timeout) = self.connect_timeout {
            if timeout.as_millis() < 100 {
                errors.push("Connect timeout too short (minimum: 100ms)".to_string());
            }
        }

        if let Some(timeout) = self.handshake_timeout {
            if timeout.as_millis() < 100 {
                errors.push("Client handshake timeout too short (minimum: 100ms)".to_string());
            }
        }

        if self.logout_drain_timeout.as_secs() > 60 {
            errors.push("Logout drain timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Framing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Initial capacity of the reassembly buffer
    pub read_buffer_capacity: usize,

    /// Largest payload accepted or produced; at most 65535
    pub max_payload_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_capacity: 8 * 1024,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "Max payload size too large: {} bytes (the length field allows {MAX_PAYLOAD_SIZE})",
                self.max_payload_size
            ));
        }

        if self.read_buffer_capacity < 64 {
            errors.push("Read buffer capacity too small (minimum: 64 bytes)".to_string());
        } else if self.read_buffer_capacity > 16 * 1024 * 1024 {
            errors.push("Read buffer capacity too large (maximum: 16 MB)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level, used when `RUST_LOG` is not set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mog-session"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional timeouts: milliseconds, with 0 or a missing key meaning "none"
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.map(|d| d.as_millis() as u64).unwrap_or(0);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn example_config_round_trips() {
        let text = NetworkConfig::example_config();
        let parsed = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.server.port, DEFAULT_PORT);
        assert_eq!(parsed.client.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
    }

    #[test]
    fn zero_timeout_means_none() {
        let parsed = NetworkConfig::from_toml(
            r#"
            [client]
            connect_timeout = 0
            handshake_timeout = 1500
            logout_drain_timeout = 100
            nodelay = false
            "#,
        )
        .unwrap();
        assert_eq!(parsed.client.connect_timeout, None);
        assert_eq!(
            parsed.client.handshake_timeout,
            Some(Duration::from_millis(1500))
        );
        assert!(!parsed.client.nodelay);
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MOG_SESSION_SERVER_ADDRESS", "127.0.0.1"),
            ("MOG_SESSION_SERVER_PORT", "4000"),
            ("MOG_SESSION_ENABLE_IPV6", "false"),
            ("MOG_SESSION_HANDSHAKE_TIMEOUT_MS", "0"),
            ("MOG_SESSION_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let config =
            NetworkConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.server.address, Ipv4Addr::LOCALHOST);
        assert_eq!(config.server.port, 4000);
        assert!(!config.server.enable_ipv6);
        assert_eq!(config.server.handshake_timeout, None);
        assert_eq!(config.client.handshake_timeout, None);
        assert_eq!(config.logging.log_level, Level::DEBUG);
    }

    #[test]
    fn env_rejects_garbage() {
        let result = NetworkConfig::from_lookup(|key| {
            (key == "MOG_SESSION_SERVER_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }
}
