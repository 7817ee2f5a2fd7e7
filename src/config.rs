//! # Configuration Management
//!
//! Centralized configuration for the peer transport.
//!
//! Covers the values the transport consumes from outside: listening ports,
//! whether non-loopback peers are permitted, the duplicate-address admission
//! threshold, connect timeouts, framing limits and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - `PEER_TRANSPORT_*` environment variables via `from_env()`
//! - Direct instantiation with defaults
//!
//! ## Wire Limits
//! The reliable channel works in a 2048-byte buffer; two bytes go to the
//! length prefix, leaving 2046 bytes of payload per frame. Datagrams carry at
//! most 1024 bytes.

use crate::error::{Result, TransportError};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Size of the working buffer one frame (header included) must fit in
pub const WORKING_BUFFER_SIZE: usize = 2048;

/// Length of the big-endian frame length prefix
pub const FRAME_HEADER_LEN: usize = 2;

/// Max allowed frame payload
pub const MAX_FRAME_SIZE: usize = WORKING_BUFFER_SIZE - FRAME_HEADER_LEN;

/// Receive accumulation capacity: one full max-size frame plus one partial one
pub const RECEIVE_BUFFER_SIZE: usize = WORKING_BUFFER_SIZE * 2;

/// Max allowed datagram payload
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Length of the datagram challenge token
pub const CHALLENGE_LEN: usize = 4;

/// Default capacity of the connection event broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Main transport configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TransportConfig {
    /// Listening side configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Connecting side configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Framing limits
    #[serde(default)]
    pub framing: FramingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TransportConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            TransportError::ConfigError(format!("Failed to open config file: {e}"))
        })?;

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| {
            TransportError::ConfigError(format!("Failed to read config file: {e}"))
        })?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TransportError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("PEER_TRANSPORT_TCP_PORT")? {
            config.server.tcp_port = port;
        }

        if let Some(port) = env_parse::<u16>("PEER_TRANSPORT_UDP_PORT")? {
            config.server.udp_port = port;
        }

        if let Some(allow) = env_parse::<bool>("PEER_TRANSPORT_ALLOW_REMOTE")? {
            config.server.allow_remote = allow;
        }

        if let Some(max) = env_parse::<i32>("PEER_TRANSPORT_MAX_DUPLICATE_ADDRESSES")? {
            config.server.max_duplicate_addresses = max;
        }

        if let Some(ms) = env_parse::<u64>("PEER_TRANSPORT_CONNECT_TIMEOUT_MS")? {
            config.client.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(port) = env_parse::<u16>("PEER_TRANSPORT_CLIENT_DATAGRAM_PORT")? {
            config.client.datagram_port = Some(port);
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
        let content = toml::to_string_pretty(self).map_err(|e| {
            TransportError::ConfigError(format!("Failed to serialize config: {e}"))
        })?;

        std::fs::write(path, content).map_err(|e| {
            TransportError::ConfigError(format!("Failed to write config file: {e}"))
        })?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.framing.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Parse an optional environment variable, failing loudly on garbage
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| TransportError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Listening side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port for the reliable stream listener (0 = ephemeral)
    pub tcp_port: u16,

    /// Port for the shared datagram socket (0 = ephemeral)
    pub udp_port: u16,

    /// Whether non-loopback peers may connect
    pub allow_remote: bool,

    /// Maximum live connections sharing one remote address; zero or negative disables the cap
    pub max_duplicate_addresses: i32,

    /// Capacity of the connection event broadcast channel
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: 7400,
            udp_port: 7401,
            allow_remote: false,
            max_duplicate_addresses: 0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Validate listening side configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.event_capacity == 0 {
            errors.push("Event capacity must be greater than 0".to_string());
        } else if self.event_capacity > 1_000_000 {
            errors.push(format!(
                "Event capacity too large: {} (max recommended: 1,000,000)",
                self.event_capacity
            ));
        }

        if self.max_duplicate_addresses > 100_000 {
            errors.push(format!(
                "Max duplicate addresses very high: {} (use 0 to disable the cap)",
                self.max_duplicate_addresses
            ));
        }

        errors
    }
}

/// Connecting side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Upper bound on an outbound stream connect
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Server datagram port to open the unreliable channel to after connecting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datagram_port: Option<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: timeout::DEFAULT_CONNECT_TIMEOUT,
            datagram_port: None,
        }
    }
}

impl ClientConfig {
    /// Validate connecting side configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.datagram_port == Some(0) {
            errors.push("Client datagram port must name a real server port, not 0".to_string());
        }

        errors
    }
}

/// Framing limits for both channels
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FramingConfig {
    /// Maximum reliable frame payload in bytes
    pub max_frame_size: usize,

    /// Maximum datagram payload in bytes
    pub max_datagram_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl FramingConfig {
    /// Validate framing limits
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size == 0 {
            errors.push("Max frame size cannot be 0".to_string());
        } else if self.max_frame_size > MAX_FRAME_SIZE {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum: {MAX_FRAME_SIZE})",
                self.max_frame_size
            ));
        }

        if self.max_datagram_size < CHALLENGE_LEN {
            errors.push(format!(
                "Max datagram size too small: {} bytes (minimum: {CHALLENGE_LEN})",
                self.max_datagram_size
            ));
        } else if self.max_datagram_size > MAX_DATAGRAM_SIZE {
            errors.push(format!(
                "Max datagram size too large: {} bytes (maximum: {MAX_DATAGRAM_SIZE})",
                self.max_datagram_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peer-transport"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
