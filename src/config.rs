//! Configuration module for the sensor node and the collector.
//!
//! Configuration is built once at startup, either from environment variables
//! (`SENSOR_TELEMETRY_*`) or, for the log store, from a JSON file, and then
//! passed by reference into the client, server and store constructors.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

/// Prefix shared by every environment variable read here.
const ENV_PREFIX: &str = "SENSOR_TELEMETRY_";

/// Default directory for active log files
const DEFAULT_LOG_DIR: &str = "./logs";

/// Subdirectory of the log directory that holds archives by default
const DEFAULT_ARCHIVE_SUBDIR: &str = "archive";

/// Default active file name pattern, one file per UTC day
const DEFAULT_FILENAME_PATTERN: &str = "sensors_%Y-%m-%d.csv";

/// Default number of records buffered before a flush
const DEFAULT_BUFFER_SIZE: usize = 100;

/// Maximum allowed buffer size to prevent memory issues
const MAX_BUFFER_SIZE: usize = 100_000;

/// Buffered records allowed per `buffer_size` before ingest pushes back
const PENDING_FACTOR: usize = 16;

const DEFAULT_ROTATE_EVERY_HOURS: f64 = 24.0;
const DEFAULT_MAX_SIZE_MB: f64 = 10.0;
const DEFAULT_RETENTION_DAYS: u32 = 7;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_SERVER_READ_TIMEOUT_SECS: u64 = 10;

const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 9000;
const DEFAULT_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;

const DEFAULT_READ_INTERVAL_MS: u64 = 1000;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECS_PER_HOUR: f64 = 3600.0;

/// Error type for configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error for {var}: {message}")]
    InvalidVar { var: String, message: String },

    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl ConfigError {
    fn var(var: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidVar {
            var: var.to_string(),
            message: message.into(),
        }
    }
}

/// How the delivery client manages its TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Open a fresh connection for every message
    #[default]
    PerMessage,

    /// Keep one connection open across messages, reconnecting after failures
    Persistent,
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per-message" | "per_message" => Ok(ConnectionMode::PerMessage),
            "persistent" => Ok(ConnectionMode::Persistent),
            other => Err(format!(
                "'{}' is not a connection mode (expected per-message or persistent)",
                other
            )),
        }
    }
}

/// Settings for the log store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Directory holding active log files
    pub log_dir: PathBuf,

    /// Directory holding compressed archives
    pub archive_dir: PathBuf,

    /// strftime pattern for active file names; encodes the rotation period
    pub filename_pattern: String,

    /// Records buffered in memory before a flush
    pub buffer_size: usize,

    /// Buffered records at which ingest starts rejecting new records
    pub max_pending: usize,

    /// Rotate once the active file has been open this long
    pub rotate_every: Duration,

    /// Rotate once the active file reaches this size
    pub max_size_bytes: u64,

    /// Rotate once the active file holds this many data rows
    pub rotate_after_lines: Option<u64>,

    /// Archives older than this many whole days are deleted
    pub retention_days: u32,

    /// Period of the writer's maintenance tick; `None` disables it
    pub flush_interval: Option<Duration>,
}

impl StoreConfig {
    /// Default settings rooted at `log_dir`, archiving into `log_dir/archive`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let log_dir = log_dir.into();
        Self {
            archive_dir: log_dir.join(DEFAULT_ARCHIVE_SUBDIR),
            log_dir,
            filename_pattern: DEFAULT_FILENAME_PATTERN.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pending: DEFAULT_BUFFER_SIZE * PENDING_FACTOR,
            rotate_every: hours(DEFAULT_ROTATE_EVERY_HOURS),
            max_size_bytes: megabytes(DEFAULT_MAX_SIZE_MB),
            rotate_after_lines: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            flush_interval: Some(Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)),
        }
    }

    /// Load store settings from a JSON file using the logger's field names:
    /// `log_dir`, `filename_pattern`, `buffer_size`, `rotate_every_hours`,
    /// `max_size_mb`, `retention_days`, and optionally `archive_dir`,
    /// `rotate_after_lines`, `flush_interval_secs`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: StoreFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        file.into_config()
    }

    /// Check invariants the store relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer size must be greater than 0".to_string(),
            ));
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer size {} exceeds maximum allowed ({})",
                self.buffer_size, MAX_BUFFER_SIZE
            )));
        }
        if self.max_pending < self.buffer_size {
            return Err(ConfigError::Invalid(format!(
                "max pending {} is below buffer size {}",
                self.max_pending, self.buffer_size
            )));
        }
        if self.max_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max file size must be greater than 0".to_string(),
            ));
        }
        if self.rotate_after_lines == Some(0) {
            return Err(ConfigError::Invalid(
                "rotate_after_lines must be greater than 0 when set".to_string(),
            ));
        }
        if !self.filename_pattern.contains('%') {
            return Err(ConfigError::Invalid(format!(
                "filename pattern '{}' must contain a date specifier",
                self.filename_pattern
            )));
        }
        Ok(())
    }
}

/// On-disk JSON layout of the store settings.
#[derive(Debug, Deserialize)]
struct StoreFile {
    log_dir: PathBuf,
    #[serde(default)]
    archive_dir: Option<PathBuf>,
    filename_pattern: String,
    buffer_size: usize,
    rotate_every_hours: f64,
    max_size_mb: f64,
    #[serde(default)]
    rotate_after_lines: Option<u64>,
    retention_days: u32,
    #[serde(default)]
    flush_interval_secs: Option<u64>,
}

impl StoreFile {
    fn into_config(self) -> Result<StoreConfig, ConfigError> {
        let mut config = StoreConfig::new(self.log_dir);
        if let Some(archive_dir) = self.archive_dir {
            config.archive_dir = archive_dir;
        }
        config.filename_pattern = self.filename_pattern;
        config.buffer_size = self.buffer_size;
        config.max_pending = self.buffer_size.saturating_mul(PENDING_FACTOR);
        config.rotate_every = checked_hours("rotate_every_hours", self.rotate_every_hours)?;
        config.max_size_bytes = checked_megabytes("max_size_mb", self.max_size_mb)?;
        config.rotate_after_lines = self.rotate_after_lines;
        config.retention_days = self.retention_days;
        if let Some(secs) = self.flush_interval_secs {
            config.flush_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }
}

/// Settings for the collector's delivery server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the collector listens on
    pub listen_addr: String,

    /// Persist the producer's timestamp instead of the receipt time
    pub trust_client_timestamp: bool,

    /// Time allowed for a peer to deliver one complete message
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            trust_client_timestamp: false,
            read_timeout: Duration::from_secs(DEFAULT_SERVER_READ_TIMEOUT_SECS),
        }
    }
}

/// Settings for the sensor node's delivery client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Collector host name or address
    pub host: String,

    /// Collector port
    pub port: u16,

    /// Timeout for a single send-and-acknowledge attempt
    pub timeout: Duration,

    /// Total number of attempts per reading
    pub retries: u32,

    /// Base delay of the exponential backoff between attempts
    pub retry_base_delay: Duration,

    /// Connection handling strategy
    pub connection_mode: ConnectionMode,
}

impl ClientConfig {
    /// `host:port` of the collector.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            retries: DEFAULT_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            connection_mode: ConnectionMode::PerMessage,
        }
    }
}

/// Complete configuration for both processes.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,

    /// Sampling period of the simulated sensors
    pub read_interval: Duration,
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            store: StoreConfig::new(DEFAULT_LOG_DIR),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            read_interval: Duration::from_millis(DEFAULT_READ_INTERVAL_MS),
        }
    }
}

impl Config {
    /// Load configuration from `SENSOR_TELEMETRY_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed or is
    /// outside its allowed range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sensor_telemetry::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Logging to {}", config.store.log_dir.display());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup. Keys are the
    /// full variable names, prefix included.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let log_dir: PathBuf = vars.get("LOG_DIR", PathBuf::from(DEFAULT_LOG_DIR))?;
        let mut store = StoreConfig::new(log_dir.clone());
        store.archive_dir = vars.get("ARCHIVE_DIR", log_dir.join(DEFAULT_ARCHIVE_SUBDIR))?;
        store.filename_pattern =
            vars.get("FILENAME_PATTERN", DEFAULT_FILENAME_PATTERN.to_string())?;
        store.buffer_size = vars.get("BUFFER_SIZE", DEFAULT_BUFFER_SIZE)?;
        if store.buffer_size == 0 {
            return Err(ConfigError::var(
                &vars.name("BUFFER_SIZE"),
                "buffer size must be greater than 0",
            ));
        }
        store.max_pending = store.buffer_size.saturating_mul(PENDING_FACTOR);
        store.rotate_every = checked_hours(
            &vars.name("ROTATE_EVERY_HOURS"),
            vars.get("ROTATE_EVERY_HOURS", DEFAULT_ROTATE_EVERY_HOURS)?,
        )?;
        store.max_size_bytes = checked_megabytes(
            &vars.name("MAX_SIZE_MB"),
            vars.get("MAX_SIZE_MB", DEFAULT_MAX_SIZE_MB)?,
        )?;
        store.rotate_after_lines = vars.get_optional("ROTATE_AFTER_LINES")?;
        store.retention_days = vars.get("RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?;
        let flush_secs: u64 = vars.get("FLUSH_INTERVAL_SECS", DEFAULT_FLUSH_INTERVAL_SECS)?;
        store.flush_interval = (flush_secs > 0).then(|| Duration::from_secs(flush_secs));
        store.validate()?;

        let server = ServerConfig {
            listen_addr: vars.get("LISTEN_ADDR", DEFAULT_LISTEN_ADDR.to_string())?,
            trust_client_timestamp: vars.get("TRUST_CLIENT_TIMESTAMP", false)?,
            read_timeout: Duration::from_secs(
                vars.get("SERVER_READ_TIMEOUT_SECS", DEFAULT_SERVER_READ_TIMEOUT_SECS)?,
            ),
        };

        let timeout_secs: f64 = vars.get("TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .ok_or_else(|| {
                ConfigError::var(&vars.name("TIMEOUT_SECS"), "timeout must be positive")
            })?;

        let retries: u32 = vars.get("RETRIES", DEFAULT_RETRIES)?;
        if retries == 0 {
            return Err(ConfigError::var(
                &vars.name("RETRIES"),
                "at least one attempt is required",
            ));
        }

        let client = ClientConfig {
            host: vars.get("SERVER_HOST", DEFAULT_SERVER_HOST.to_string())?,
            port: vars.get("SERVER_PORT", DEFAULT_SERVER_PORT)?,
            timeout,
            retries,
            retry_base_delay: Duration::from_millis(
                vars.get("RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?,
            ),
            connection_mode: vars.get("CONNECTION_MODE", ConnectionMode::PerMessage)?,
        };

        let read_interval = Duration::from_millis(
            vars.get("READ_INTERVAL_MS", DEFAULT_READ_INTERVAL_MS)?,
        );

        Ok(Self {
            store,
            server,
            client,
            read_interval,
        })
    }
}

/// Prefixed variable lookup with typed parsing.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn name(&self, key: &str) -> String {
        format!("{}{}", ENV_PREFIX, key)
    }

    fn get_optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let var = self.name(key);
        match (self.lookup)(&var) {
            Some(value) if !value.trim().is_empty() => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::var(&var, format!("'{}' is invalid: {}", value, e))),
            _ => Ok(None),
        }
    }

    fn get<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.get_optional(key)?.unwrap_or(default))
    }
}

fn hours(value: f64) -> Duration {
    Duration::from_secs_f64(value * SECS_PER_HOUR)
}

fn megabytes(value: f64) -> u64 {
    (value * BYTES_PER_MB) as u64
}

fn checked_hours(var: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value * SECS_PER_HOUR)
        .map_err(|_| ConfigError::var(var, format!("{} is not a valid number of hours", value)))
}

fn checked_megabytes(var: &str, value: f64) -> Result<u64, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::var(
            var,
            format!("{} is not a positive size in MB", value),
        ));
    }
    Ok(megabytes(value).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.log_dir, PathBuf::from("./logs"));
        assert_eq!(config.store.archive_dir, PathBuf::from("./logs/archive"));
        assert_eq!(config.store.buffer_size, 100);
        assert_eq!(config.store.rotate_every, Duration::from_secs(24 * 3600));
        assert_eq!(config.store.max_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.store.rotate_after_lines, None);
        assert_eq!(config.client.retries, 3);
        assert_eq!(config.client.connection_mode, ConnectionMode::PerMessage);
        assert_eq!(config.client.target(), "127.0.0.1:9000");
        assert!(config.store.validate().is_ok());
    }

    #[test]
    fn test_config_from_lookup_with_defaults() {
        let config = Config::from_lookup(lookup(&[])).expect("Should load with defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_from_lookup_custom_values() {
        let config = Config::from_lookup(lookup(&[
            ("LOG_DIR", "/var/lib/sensors"),
            ("BUFFER_SIZE", "10"),
            ("ROTATE_EVERY_HOURS", "0.5"),
            ("MAX_SIZE_MB", "1"),
            ("ROTATE_AFTER_LINES", "500"),
            ("RETENTION_DAYS", "30"),
            ("FLUSH_INTERVAL_SECS", "0"),
            ("SERVER_HOST", "collector.local"),
            ("SERVER_PORT", "9100"),
            ("TIMEOUT_SECS", "2.5"),
            ("RETRIES", "5"),
            ("CONNECTION_MODE", "persistent"),
            ("TRUST_CLIENT_TIMESTAMP", "true"),
        ]))
        .expect("Should load custom values");

        assert_eq!(config.store.archive_dir, PathBuf::from("/var/lib/sensors/archive"));
        assert_eq!(config.store.buffer_size, 10);
        assert_eq!(config.store.max_pending, 160);
        assert_eq!(config.store.rotate_every, Duration::from_secs(1800));
        assert_eq!(config.store.max_size_bytes, 1024 * 1024);
        assert_eq!(config.store.rotate_after_lines, Some(500));
        assert_eq!(config.store.retention_days, 30);
        assert_eq!(config.store.flush_interval, None);
        assert_eq!(config.client.target(), "collector.local:9100");
        assert_eq!(config.client.timeout, Duration::from_millis(2500));
        assert_eq!(config.client.retries, 5);
        assert_eq!(config.client.connection_mode, ConnectionMode::Persistent);
        assert!(config.server.trust_client_timestamp);
    }

    #[test]
    fn test_zero_rotation_interval_is_allowed() {
        let config = Config::from_lookup(lookup(&[("ROTATE_EVERY_HOURS", "0")])).unwrap();
        assert_eq!(config.store.rotate_every, Duration::ZERO);
    }

    #[test]
    fn test_invalid_buffer_size() {
        let err = Config::from_lookup(lookup(&[("BUFFER_SIZE", "not_a_number")])).unwrap_err();
        assert!(err.to_string().contains("SENSOR_TELEMETRY_BUFFER_SIZE"));

        let err = Config::from_lookup(lookup(&[("BUFFER_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than 0"));

        let err = Config::from_lookup(lookup(&[("BUFFER_SIZE", "999999")])).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_invalid_rotation_and_size() {
        let err = Config::from_lookup(lookup(&[("ROTATE_EVERY_HOURS", "-1")])).unwrap_err();
        assert!(err.to_string().contains("ROTATE_EVERY_HOURS"));

        let err = Config::from_lookup(lookup(&[("MAX_SIZE_MB", "0")])).unwrap_err();
        assert!(err.to_string().contains("positive size"));

        let err = Config::from_lookup(lookup(&[("ROTATE_AFTER_LINES", "0")])).unwrap_err();
        assert!(err.to_string().contains("rotate_after_lines"));
    }

    #[test]
    fn test_invalid_client_settings() {
        let err = Config::from_lookup(lookup(&[("RETRIES", "0")])).unwrap_err();
        assert!(err.to_string().contains("at least one attempt"));

        let err = Config::from_lookup(lookup(&[("TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("positive"));

        let err = Config::from_lookup(lookup(&[("CONNECTION_MODE", "pooled")])).unwrap_err();
        assert!(err.to_string().contains("not a connection mode"));
    }

    #[test]
    fn test_filename_pattern_needs_date_specifier() {
        let err = Config::from_lookup(lookup(&[("FILENAME_PATTERN", "sensors.csv")])).unwrap_err();
        assert!(err.to_string().contains("date specifier"));
    }

    #[test]
    fn test_store_config_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "log_dir": "/tmp/sensor-logs",
                "filename_pattern": "readings_%Y%m%d.csv",
                "buffer_size": 5,
                "rotate_every_hours": 1,
                "max_size_mb": 0.5,
                "rotate_after_lines": 1000,
                "retention_days": 3
            }}"#
        )
        .unwrap();

        let config = StoreConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.archive_dir, PathBuf::from("/tmp/sensor-logs/archive"));
        assert_eq!(config.filename_pattern, "readings_%Y%m%d.csv");
        assert_eq!(config.buffer_size, 5);
        assert_eq!(config.rotate_every, Duration::from_secs(3600));
        assert_eq!(config.max_size_bytes, 512 * 1024);
        assert_eq!(config.rotate_after_lines, Some(1000));
        assert_eq!(config.retention_days, 3);
    }

    #[test]
    fn test_store_config_from_missing_file() {
        let err = StoreConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_connection_mode_parsing() {
        assert_eq!("per-message".parse::<ConnectionMode>(), Ok(ConnectionMode::PerMessage));
        assert_eq!("Persistent".parse::<ConnectionMode>(), Ok(ConnectionMode::Persistent));
        assert!("".parse::<ConnectionMode>().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::var("TEST_VAR", "test error");
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error = ConfigError::Invalid("general error".to_string());
        assert_eq!(format!("{}", error), "Configuration error: general error");
    }
}
