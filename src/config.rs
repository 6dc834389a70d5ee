//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the connections they own.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (prefix `FRAMELINK_`)
//!
//! ## Defaults
//! - 10 MiB maximum frame, 16 KiB read scratch buffer, 1024-slot send queue
//! - 5 minute idle timeout checked every 30 seconds
//! - 100 messages/second per connection
//! - 3 retries with exponential delay from 1s up to 10s

use crate::error::{EngineError, Result};
use crate::protocol::{ProtocolKind, DEFAULT_MAX_MESSAGE_SIZE};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Environment variable prefix used by `from_env`
pub const ENV_PREFIX: &str = "FRAMELINK_";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Per-connection configuration shared by servers and clients
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| EngineError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_var("SERVER_ADDRESS") {
            config.server.address = addr;
        }
        if let Some(addr) = env_var("CLIENT_ADDRESS") {
            config.client.address = addr;
        }
        if let Some(val) = env_parse::<usize>("MAX_CONNECTIONS")? {
            config.server.max_connections = val;
        }
        if let Some(val) = env_parse::<usize>("MAX_MESSAGE_SIZE")? {
            config.connection.max_message_size = val;
        }
        if let Some(val) = env_parse::<usize>("SEND_QUEUE_SIZE")? {
            config.connection.send_queue_size = val;
        }
        if let Some(val) = env_parse::<u64>("IDLE_TIMEOUT_MS")? {
            config.connection.idle_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("CONNECT_TIMEOUT_MS")? {
            config.client.connect_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<f64>("RATE_LIMIT")? {
            config.connection.rate_limit = val;
        }
        if let Some(val) = env_parse::<u32>("MAX_RETRIES")? {
            config.connection.retry.max_retries = val;
            config.server.retry.max_retries = val;
        }
        if let Some(kind) = env_parse::<ProtocolKind>("PROTOCOL")? {
            config.connection.protocol = kind;
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
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            EngineError::Config(format!("Invalid value for {ENV_PREFIX}{name}: '{raw}'"))
        }),
        None => Ok(None),
    }
}

/// Retry policy for transient I/O errors
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed before the operation is abandoned
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_serde")]
    pub base_delay: Duration,

    /// Upper bound for the doubled delay
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,

    /// Random extra delay as a fraction of the current delay (0.0 to 1.0)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.base_delay.is_zero() {
            errors.push("Retry base delay must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            errors.push("Retry max delay cannot be shorter than base delay".to_string());
        }
        if self.max_retries > 100 {
            errors.push(format!("Max retries too large: {} (maximum: 100)", self.max_retries));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            errors.push(format!("Invalid retry jitter: {} (valid range: 0.0-1.0)", self.jitter));
        }

        errors
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of concurrently registered connections
    pub max_connections: usize,

    /// Pause after refusing a connection while at capacity
    #[serde(with = "duration_serde")]
    pub refuse_backoff: Duration,

    /// Retry policy for transient accept errors
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_connections: 1000,
            refuse_backoff: timeout::REFUSE_BACKOFF,
            retry: RetryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.refuse_backoff.as_secs() > 10 {
            errors.push("Refuse backoff too long (maximum: 10s)".to_string());
        }

        errors.extend(self.retry.validate());
        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for a single dial attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Extra dial attempts after a transient failure
    pub max_retries: u32,

    /// Delay before the first dial retry (doubles per attempt)
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connect_timeout: timeout::CONNECT_TIMEOUT,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.contains(':') {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:8080')",
                self.address
            ));
        }

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.retry_delay.as_secs() > 60 {
            errors.push("Retry delay too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Framing used on the wire
    #[serde(default)]
    pub protocol: ProtocolKind,

    /// Largest frame accepted or produced; also bounds the accumulation buffer
    pub max_message_size: usize,

    /// Size of the socket read scratch buffer
    pub read_buffer_size: usize,

    /// Capacity of the outbound queue
    pub send_queue_size: usize,

    /// Time without reads or writes before the connection is closed
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Interval of the idle check
    #[serde(with = "duration_serde")]
    pub idle_check_interval: Duration,

    /// Deadline for a single socket write
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Messages per second for each loop; 0 disables limiting
    pub rate_limit: f64,

    /// Token bucket capacity
    pub rate_burst: u32,

    /// Retry policy for transient read/write errors
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: 16 * 1024,
            send_queue_size: 1024,
            idle_timeout: timeout::IDLE_TIMEOUT,
            idle_check_interval: timeout::IDLE_CHECK_INTERVAL,
            write_timeout: timeout::WRITE_TIMEOUT,
            rate_limit: 100.0,
            rate_burst: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size < 64 {
            errors.push("Max message size too small (minimum: 64 bytes)".to_string());
        } else if self.max_message_size > u32::MAX as usize {
            errors.push(format!(
                "Max message size too large: {} bytes (must fit in a 32-bit length field)",
                self.max_message_size
            ));
        }

        if self.read_buffer_size == 0 {
            errors.push("Read buffer size must be greater than 0".to_string());
        }

        if self.send_queue_size == 0 {
            errors.push("Send queue size must be greater than 0".to_string());
        } else if self.send_queue_size > 1_000_000 {
            errors.push(format!(
                "Send queue size too large: {} (max recommended: 1,000,000)",
                self.send_queue_size
            ));
        }

        if self.idle_timeout.is_zero() {
            errors.push("Idle timeout must be greater than 0".to_string());
        }
        if self.idle_check_interval.is_zero() {
            errors.push("Idle check interval must be greater than 0".to_string());
        } else if self.idle_check_interval > self.idle_timeout {
            errors.push("Idle check interval cannot exceed the idle timeout".to_string());
        }

        if self.write_timeout.is_zero() {
            errors.push("Write timeout must be greater than 0".to_string());
        }

        if self.rate_limit < 0.0 || !self.rate_limit.is_finite() {
            errors.push(format!("Invalid rate limit: {}", self.rate_limit));
        }
        if self.rate_limit > 0.0 && self.rate_burst == 0 {
            errors.push("Rate burst must be greater than 0 when rate limiting".to_string());
        }

        errors.extend(self.retry.validate());
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

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framelink"),
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
