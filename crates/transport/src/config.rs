//! Configuration management for tunnelmux transports.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tunnelmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("pattern must be one of: NN, NNpsk0, XX, XXpsk0, IK; got {0}")]
    InvalidPattern(String),

    #[error("high_water_mark must be greater than 0, got {0}")]
    InvalidHighWaterMark(usize),

    #[error("max_buffered must be greater than 0, got {0}")]
    InvalidMaxBuffered(usize),

    #[error("max_batch must be between 1 and 16777215 bytes, got {0}")]
    InvalidMaxBatch(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest batch a single frame can carry.
const MAX_BATCH_LIMIT: usize = protocol::MAX_FRAME_SIZE;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Secure stream settings.
    pub stream: StreamConfig,

    /// Multiplexer settings.
    pub mux: MuxConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Secure stream settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Noise handshake pattern.
    pub pattern: String,

    /// Interval in milliseconds between keep-alive frames (0 = off).
    pub keep_alive_ms: u64,

    /// Inactivity timeout in milliseconds (0 = off).
    pub timeout_ms: u64,

    /// Queued bytes after which writes report backpressure.
    pub high_water_mark: usize,
}

/// Multiplexer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MuxConfig {
    /// Byte budget for messages addressed to channels not yet opened locally.
    pub max_buffered: usize,

    /// Batch size in bytes after which a corked batch is flushed.
    pub max_batch: usize,

    /// Maximum number of unanswered remote opens (unset = unlimited).
    pub max_backlog: Option<usize>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pattern: Pattern::XX.to_string(),
            keep_alive_ms: 0,
            timeout_ms: 0,
            high_water_mark: 64 * 1024,
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_buffered: 32 * 1024,
            max_batch: 8 * 1024 * 1024,
            max_backlog: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelmux")
        .join("config.toml")
}

fn env_millis(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok().filter(|v| !v.is_empty())?;
    match value.parse() {
        Ok(ms) => Some(ms),
        Err(_) => {
            tracing::warn!("Ignoring {}: not a number of milliseconds: {}", name, value);
            None
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - TUNNELMUX_KEEP_ALIVE_MS: Override the keep-alive interval
    /// - TUNNELMUX_TIMEOUT_MS: Override the inactivity timeout
    /// - TUNNELMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_millis("TUNNELMUX_KEEP_ALIVE_MS") {
            tracing::info!("Overriding keep_alive_ms from environment: {}", ms);
            self.stream.keep_alive_ms = ms;
        }

        if let Some(ms) = env_millis("TUNNELMUX_TIMEOUT_MS") {
            tracing::info!("Overriding timeout_ms from environment: {}", ms);
            self.stream.timeout_ms = ms;
        }

        if let Ok(level) = std::env::var("TUNNELMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.pattern.parse::<Pattern>().is_err() {
            return Err(ConfigError::InvalidPattern(self.stream.pattern.clone()));
        }

        if self.stream.high_water_mark == 0 {
            return Err(ConfigError::InvalidHighWaterMark(self.stream.high_water_mark));
        }

        if self.mux.max_buffered == 0 {
            return Err(ConfigError::InvalidMaxBuffered(self.mux.max_buffered));
        }

        if self.mux.max_batch == 0 || self.mux.max_batch > MAX_BATCH_LIMIT {
            return Err(ConfigError::InvalidMaxBatch(self.mux.max_batch));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Returns the configured handshake pattern.
    pub fn pattern(&self) -> Result<Pattern, ConfigError> {
        self.stream
            .pattern
            .parse()
            .map_err(|_| ConfigError::InvalidPattern(self.stream.pattern.clone()))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stream.pattern, "XX");
        assert_eq!(config.stream.keep_alive_ms, 0);
        assert_eq!(config.stream.timeout_ms, 0);
        assert_eq!(config.stream.high_water_mark, 65536);
        assert_eq!(config.mux.max_buffered, 32768);
        assert_eq!(config.mux.max_batch, 8 * 1024 * 1024);
        assert_eq!(config.mux.max_backlog, None);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[stream]
keep_alive_ms = 5000

[mux]
max_backlog = 16
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.stream.keep_alive_ms, 5000);
        assert_eq!(config.stream.pattern, "XX");
        assert_eq!(config.mux.max_backlog, Some(16));
        assert_eq!(config.mux.max_buffered, 32768);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[stream\nkeep_alive_ms = 1");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[stream]\ntimeout_ms = \"soon\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.stream.pattern = "IK".to_string();
        config.stream.timeout_ms = 30_000;
        config.mux.max_backlog = Some(4);
        config.logging.level = "debug".to_string();

        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.pattern().unwrap(), Pattern::IK);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("config.toml");

        let mut config = Config::default();
        config.stream.keep_alive_ms = 1000;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("tunnelmux/config.toml"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[stream]
pattern = "NN"
legacy_option = true
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.stream.pattern, "NN");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.stream.pattern = "KK".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPattern("KK".to_string()))
        );

        let mut config = Config::default();
        config.stream.high_water_mark = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHighWaterMark(0)));

        let mut config = Config::default();
        config.mux.max_buffered = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxBuffered(0)));

        let mut config = Config::default();
        config.mux.max_batch = MAX_BATCH_LIMIT + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxBatch(MAX_BATCH_LIMIT + 1))
        );

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_override_timers() {
        std::env::set_var("TUNNELMUX_KEEP_ALIVE_MS", "2500");
        std::env::set_var("TUNNELMUX_TIMEOUT_MS", "10000");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.stream.keep_alive_ms, 2500);
        assert_eq!(config.stream.timeout_ms, 10000);

        std::env::remove_var("TUNNELMUX_KEEP_ALIVE_MS");
        std::env::remove_var("TUNNELMUX_TIMEOUT_MS");
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_number_ignored() {
        std::env::set_var("TUNNELMUX_TIMEOUT_MS", "later");

        let mut config = Config::default();
        config.stream.timeout_ms = 42;
        config.apply_env_overrides();
        assert_eq!(config.stream.timeout_ms, 42);

        std::env::remove_var("TUNNELMUX_TIMEOUT_MS");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("TUNNELMUX_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "trace");

        std::env::remove_var("TUNNELMUX_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TUNNELMUX_LOG_LEVEL", "");
        std::env::set_var("TUNNELMUX_KEEP_ALIVE_MS", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.stream.keep_alive_ms, 0);

        std::env::remove_var("TUNNELMUX_LOG_LEVEL");
        std::env::remove_var("TUNNELMUX_KEEP_ALIVE_MS");
    }
}
