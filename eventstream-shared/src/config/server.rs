use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Errors produced while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file could not be parsed.
    #[error("failed to parse configuration file {path}: {message}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },
    /// The configuration file extension is not one of yaml, yml, json or toml.
    #[error("Unsupported configuration format for {0}. Use 'yaml', 'json' or 'toml'.")]
    UnsupportedFormat(PathBuf),
    /// An environment override held a value that could not be parsed.
    #[error("Invalid {name} value: {value}")]
    InvalidEnv {
        /// Environment variable name.
        name: &'static str,
        /// Raw value found in the environment.
        value: String,
    },
    /// One or more settings failed validation.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Output format for the tracing subscriber.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable, ANSI coloured lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Which event log backend the server composes at startup.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local log, lost on restart.
    #[default]
    Memory,
    /// Durable log stored in Postgres.
    Postgres,
}

/// HTTP listener settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the HTTP server.
    pub port: u16,
    /// Header carrying the request id.
    pub request_id_header: String,
    /// Value for `Access-Control-Allow-Origin`; the request host is echoed when unset.
    pub allow_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_id_header: "x-request-id".to_string(),
            allow_origin: None,
        }
    }
}

/// Logging settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive used when `RUST_LOG` is absent.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Tuning for the listener fan-out and catch-up engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Live events buffered per listener and channel before the overflow flag is raised.
    pub max_pending: usize,
    /// Maximum number of channels a single stream may subscribe to.
    pub channel_limit: usize,
    /// Idle seconds before a `keep-alive` frame is written.
    pub keep_alive_seconds: u64,
    /// Events read from the log per catch-up page, shared across the requested channels.
    pub page_size: usize,
    /// Size of the leading comment written on open to defeat proxy buffering.
    pub padding_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_pending: 10,
            channel_limit: 10,
            keep_alive_seconds: 20,
            page_size: 100,
            padding_bytes: 2048,
        }
    }
}

impl StreamConfig {
    /// Keep-alive interval as a [`Duration`].
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }
}

/// Event log storage settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selected at composition time.
    pub backend: StorageBackend,
    /// Postgres connection URL, required for the postgres backend.
    pub database_url: Option<String>,
    /// Pool size for the postgres backend.
    pub max_connections: u32,
    /// Minutes an event is retained before trimming.
    pub event_ttl_minutes: u64,
    /// Events removed per trimming pass.
    pub trim_batch: usize,
    /// Optional hard cap on retained events per channel.
    pub max_events_per_channel: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            max_connections: 5,
            event_ttl_minutes: 60 * 24,
            trim_batch: 50,
            max_events_per_channel: None,
        }
    }
}

impl StorageConfig {
    /// Retention window as a [`Duration`].
    #[must_use]
    pub const fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_minutes * 60)
    }
}

/// Session cookie settings used to derive the caller identity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the cookie holding the session id.
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "session".to_string(),
        }
    }
}

/// The main configuration structure for the `EventStream` server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Stream engine tuning.
    pub stream: StreamConfig,
    /// Event log storage.
    pub storage: StorageConfig,
    /// Identity cookie settings.
    pub session: SessionConfig,
}

impl Config {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// Values read from the file win over environment variables; environment
    /// variables only replace settings that still hold their default. The
    /// command-line port override always wins.
    ///
    /// # Arguments
    /// * `config_path` - Optional path to the configuration file.
    /// * `port_override` - Optional port number to override the configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, an
    /// environment override is malformed, or validation fails.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(&path)?,
            None => Self::with_defaults(),
        };

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => {
                serde_yml::from_str(&content).map_err(|err| parse_error(err.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|err| parse_error(err.to_string()))
            }
            Some("toml") => toml::from_str(&content).map_err(|err| parse_error(err.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let defaults = Self::with_defaults();

        if self.server.port == defaults.server.port {
            if let Some(port) = parse_env::<u16>("EVENTSTREAM_PORT")? {
                self.server.port = port;
            }
        }
        if self.logging.level == defaults.logging.level {
            if let Ok(level) = env::var("EVENTSTREAM_LOG_LEVEL") {
                self.logging.level = level;
            }
        }
        if self.logging.format == defaults.logging.format {
            if let Ok(format) = env::var("EVENTSTREAM_LOG_FORMAT") {
                self.logging.format = match format.to_ascii_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "text" => LogFormat::Text,
                    _ => {
                        return Err(ConfigError::InvalidEnv {
                            name: "EVENTSTREAM_LOG_FORMAT",
                            value: format,
                        });
                    }
                };
            }
        }
        if self.storage.database_url.is_none() {
            if let Ok(url) = env::var("EVENTSTREAM_DATABASE_URL") {
                self.storage.database_url = Some(url);
            }
        }
        if self.storage.backend == defaults.storage.backend {
            if let Ok(backend) = env::var("EVENTSTREAM_STORAGE_BACKEND") {
                self.storage.backend = match backend.to_ascii_lowercase().as_str() {
                    "memory" => StorageBackend::Memory,
                    "postgres" => StorageBackend::Postgres,
                    _ => {
                        return Err(ConfigError::InvalidEnv {
                            name: "EVENTSTREAM_STORAGE_BACKEND",
                            value: backend,
                        });
                    }
                };
            }
        }
        if self.stream.max_pending == defaults.stream.max_pending {
            if let Some(value) = parse_env::<usize>("EVENTSTREAM_MAX_PENDING")? {
                self.stream.max_pending = value;
            }
        }
        if self.stream.channel_limit == defaults.stream.channel_limit {
            if let Some(value) = parse_env::<usize>("EVENTSTREAM_CHANNEL_LIMIT")? {
                self.stream.channel_limit = value;
            }
        }
        if self.stream.keep_alive_seconds == defaults.stream.keep_alive_seconds {
            if let Some(value) = parse_env::<u64>("EVENTSTREAM_KEEP_ALIVE_SECONDS")? {
                self.stream.keep_alive_seconds = value;
            }
        }

        Ok(())
    }

    /// Validate the complete configuration.
    ///
    /// # Errors
    /// Returns every validation failure found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.stream.max_pending == 0 {
            errors.push("stream.max_pending must be at least 1".to_string());
        }
        if self.stream.channel_limit == 0 {
            errors.push("stream.channel_limit must be at least 1".to_string());
        }
        if self.stream.page_size == 0 {
            errors.push("stream.page_size must be at least 1".to_string());
        }
        if self.stream.keep_alive_seconds == 0 {
            errors.push("stream.keep_alive_seconds must be at least 1".to_string());
        }
        if self.storage.backend == StorageBackend::Postgres
            && self
                .storage
                .database_url
                .as_deref()
                .is_none_or(str::is_empty)
        {
            errors.push("storage.database_url is required for the postgres backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn cleanup_env_vars() {
        unsafe {
            for name in [
                "EVENTSTREAM_PORT",
                "EVENTSTREAM_LOG_LEVEL",
                "EVENTSTREAM_LOG_FORMAT",
                "EVENTSTREAM_DATABASE_URL",
                "EVENTSTREAM_STORAGE_BACKEND",
                "EVENTSTREAM_MAX_PENDING",
                "EVENTSTREAM_CHANNEL_LIMIT",
                "EVENTSTREAM_KEEP_ALIVE_SECONDS",
            ] {
                std::env::remove_var(name);
            }
        }
    }

    #[test]
    fn test_config_with_defaults() {
        let config = Config::with_defaults();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.stream.max_pending, 10);
        assert_eq!(config.stream.channel_limit, 10);
        assert_eq!(config.stream.keep_alive(), Duration::from_secs(20));
        assert_eq!(config.stream.page_size, 100);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.event_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    #[serial]
    fn test_load_config_with_port_override() {
        cleanup_env_vars();
        let config = Config::load_config(None, Some(3000)).unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_load_config_with_environment_variables() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("EVENTSTREAM_PORT", "9090");
            std::env::set_var("EVENTSTREAM_LOG_LEVEL", "debug");
            std::env::set_var("EVENTSTREAM_LOG_FORMAT", "json");
            std::env::set_var("EVENTSTREAM_MAX_PENDING", "4");
            std::env::set_var("EVENTSTREAM_KEEP_ALIVE_SECONDS", "5");
        }

        let config = Config::load_config(None, None).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.stream.max_pending, 4);
        assert_eq!(config.stream.keep_alive_seconds, 5);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_port_override_beats_environment() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("EVENTSTREAM_PORT", "5555");
        }

        let config = Config::load_config(None, Some(7777)).unwrap();
        assert_eq!(config.server.port, 7777);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_port_environment() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("EVENTSTREAM_PORT", "invalid_port");
        }

        let result = Config::load_config(None, None);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid EVENTSTREAM_PORT")
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_zero_port_validation() {
        cleanup_env_vars();
        let result = Config::load_config(None, Some(0));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid server port")
        );
    }

    #[test]
    #[serial]
    fn test_load_config_from_yaml_file() -> Result<(), Box<dyn std::error::Error>> {
        cleanup_env_vars();
        let temp_dir = TempDir::new()?;
        let config_file = temp_dir.path().join("eventstream.yaml");
        fs::write(
            &config_file,
            r"
server:
  port: 4000
logging:
  level: trace
  format: json
stream:
  max_pending: 3
  channel_limit: 2
",
        )?;

        let config = Config::load_config(Some(config_file), None)?;

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.stream.max_pending, 3);
        assert_eq!(config.stream.channel_limit, 2);
        assert_eq!(config.stream.page_size, 100);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_file_value_wins_over_environment() -> Result<(), Box<dyn std::error::Error>> {
        cleanup_env_vars();
        let temp_dir = TempDir::new()?;
        let config_file = temp_dir.path().join("eventstream.json");
        fs::write(&config_file, r#"{ "server": { "port": 4100 } }"#)?;
        unsafe {
            std::env::set_var("EVENTSTREAM_PORT", "9999");
        }

        let config = Config::load_config(Some(config_file), None)?;
        assert_eq!(config.server.port, 4100);

        cleanup_env_vars();
        Ok(())
    }

    #[test]
    #[serial]
    fn test_load_config_from_toml_file() -> Result<(), Box<dyn std::error::Error>> {
        cleanup_env_vars();
        let temp_dir = TempDir::new()?;
        let config_file = temp_dir.path().join("eventstream.toml");
        fs::write(
            &config_file,
            r#"
[storage]
backend = "postgres"
database_url = "postgres://localhost/events"
max_events_per_channel = 500
"#,
        )?;

        let config = Config::load_config(Some(config_file), None)?;
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.storage.max_events_per_channel, Some(500));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("eventstream.ini");
        fs::write(&config_file, "port=1").unwrap();

        let result = Config::load_config(Some(config_file), None);
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    #[serial]
    fn test_nonexistent_file() {
        let result = Config::load_config(Some(PathBuf::from("/nonexistent/eventstream.yaml")), None);
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    #[serial]
    fn test_malformed_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("broken.json");
        fs::write(&config_file, "{ not json").unwrap();

        let result = Config::load_config(Some(config_file), None);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::with_defaults();
        config.stream.max_pending = 0;
        config.stream.page_size = 0;
        config.storage.backend = StorageBackend::Postgres;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("database_url")));
    }
}
