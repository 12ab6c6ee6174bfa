//! # Configuration Management
//!
//! Centralized configuration for the ADC client.
//!
//! This module provides structured configuration for the hub session, peer
//! downloads and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`ADCGET_*` variables)
//!
//! ## Example
//! ```toml
//! [hub]
//! nick = "fetcher"
//! connect_timeout = 5000
//!
//! [download]
//! search_timeout = 8000
//! compress = true
//! ```

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Protocol version announced to hubs and peers.
pub const PROTOCOL: &str = "ADC/1.0";

/// Client version string sent in `INF`.
pub const CLIENT_VERSION: &str = concat!("adcget ", env!("CARGO_PKG_VERSION"));

/// Port used when an `adc://` URL does not name one.
pub const DEFAULT_HUB_PORT: u16 = 411;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AdcConfig {
    /// Hub session configuration
    #[serde(default)]
    pub hub: HubConfig,

    /// Search and peer transfer configuration
    #[serde(default)]
    pub download: DownloadSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AdcConfig {
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

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Override fields from `ADCGET_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(nick) = std::env::var("ADCGET_NICK") {
            self.hub.nick = nick;
        }

        if let Ok(password) = std::env::var("ADCGET_PASSWORD") {
            self.hub.password = Some(password);
        }

        if let Ok(timeout) = std::env::var("ADCGET_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                self.hub.connect_timeout = Duration::from_millis(val);
                self.download.peer_connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("ADCGET_SEARCH_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                self.download.search_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(compress) = std::env::var("ADCGET_COMPRESS") {
            self.download.compress = matches!(compress.as_str(), "1" | "true" | "yes");
        }
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
        errors.extend(self.hub.validate());
        errors.extend(self.download.validate());
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

/// Hub session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    /// Nick announced in `BINF`
    pub nick: String,

    /// Description announced in `BINF`
    pub description: String,

    /// Password answered to an `IGPA` challenge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Timeout for opening the hub connection
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout for the whole handshake
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Longest accepted protocol line in bytes
    pub max_line_length: usize,

    /// Capacity of the outbound message queue
    pub send_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            nick: String::from("adcget"),
            description: String::new(),
            password: None,
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            max_line_length: crate::core::codec::MAX_LINE_LENGTH,
            send_queue: 64,
        }
    }
}

impl HubConfig {
    /// Validate hub configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.nick.is_empty() {
            errors.push("Nick cannot be empty".to_string());
        } else if self.nick.len() > 64 {
            errors.push(format!(
                "Nick too long: {} characters (maximum: 64)",
                self.nick.len()
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.max_line_length < 1024 {
            errors.push("Max line length too small (minimum: 1 KB)".to_string());
        } else if self.max_line_length > 16 * 1024 * 1024 {
            errors.push(format!(
                "Max line length too large: {} bytes (maximum: 16 MB)",
                self.max_line_length
            ));
        }

        if self.send_queue == 0 {
            errors.push("Send queue must be greater than 0".to_string());
        }

        errors
    }
}

/// Search and transfer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// How long to wait for a verified transfer
    #[serde(with = "duration_serde")]
    pub search_timeout: Duration,

    /// Timeout for the hub to relay a peer's `CTM` plus the TCP connect
    #[serde(with = "duration_serde")]
    pub peer_connect_timeout: Duration,

    /// Longest silence tolerated from a peer mid-transfer
    #[serde(with = "duration_serde")]
    pub transfer_idle_timeout: Duration,

    /// Files larger than this get their tree leaves fetched first
    pub leaves_threshold: u64,

    /// Capacity of the result channel between hub and dispatcher
    pub result_backlog: usize,

    /// Ask peers for `ZL1` compressed transfers
    pub compress: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            search_timeout: timeout::SEARCH_TIMEOUT,
            peer_connect_timeout: timeout::DEFAULT_TIMEOUT,
            transfer_idle_timeout: timeout::TRANSFER_IDLE_TIMEOUT,
            leaves_threshold: 64 * 1024,
            result_backlog: 16,
            compress: false,
        }
    }
}

impl DownloadSettings {
    /// Validate download configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.search_timeout.as_millis() < 100 {
            errors.push("Search timeout too short (minimum: 100ms)".to_string());
        } else if self.search_timeout.as_secs() > 3600 {
            errors.push("Search timeout too long (maximum: 1 hour)".to_string());
        }

        if self.peer_connect_timeout.as_millis() < 100 {
            errors.push("Peer connect timeout too short (minimum: 100ms)".to_string());
        }

        if self.transfer_idle_timeout.as_millis() < 100 {
            errors.push("Transfer idle timeout too short (minimum: 100ms)".to_string());
        }

        if self.result_backlog == 0 {
            errors.push("Result backlog must be greater than 0".to_string());
        } else if self.result_backlog > 100_000 {
            errors.push(format!(
                "Result backlog too large: {} (max recommended: 100,000)",
                self.result_backlog
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to colour console output
    pub ansi: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("adcget"),
            log_level: Level::WARN,
            ansi: true,
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
