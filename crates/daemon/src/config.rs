//! Configuration management for the Pairline daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/pairline/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default HTTP listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("send_delay_ms must be at most 60000, got {0}")]
    InvalidSendDelay(u64),

    #[error("heartbeat_secs must be between 1 and 3600, got {0}")]
    InvalidHeartbeat(u64),

    #[error("code_interval_secs must be between 1 and 3600, got {0}")]
    InvalidCodeInterval(u64),

    #[error("engine kind \"bridge\" requires a non-empty engine.command")]
    MissingBridgeCommand,

    #[error("bind address must not be empty")]
    EmptyBind,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Pairline daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener configuration.
    pub http: HttpConfig,

    /// Session registry configuration.
    pub session: SessionConfig,

    /// Messaging engine configuration.
    pub engine: EngineConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (account ledger, engine state).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind.
    pub bind: String,

    /// Port to listen on.
    pub port: u16,
}

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of registered sessions.
    pub max_sessions: usize,

    /// Minimum delay between consecutive sends of a bulk batch, in milliseconds.
    pub send_delay_ms: u64,

    /// Interval between keep-alive frames on pairing streams, in seconds.
    pub heartbeat_secs: u64,
}

/// Which engine implementation drives sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// External bridge process speaking JSON lines over stdio.
    Bridge,
    /// In-process engine that fabricates pairing codes, for development.
    #[default]
    Simulated,
}

/// Messaging engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine implementation.
    pub kind: EngineKind,

    /// Bridge executable (bridge engine only).
    pub command: String,

    /// Extra arguments passed to the bridge before the session arguments.
    pub args: Vec<String>,

    /// Directory where the bridge keeps per-session auth state.
    pub session_dir: PathBuf,

    /// Seconds between rotated pairing codes (simulated engine only).
    pub code_interval_secs: u64,

    /// Seconds after which the simulated engine pairs on its own. Never when unset.
    pub auto_pair_secs: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            send_delay_ms: 1000,
            heartbeat_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Simulated,
            command: String::new(),
            args: Vec::new(),
            session_dir: default_data_dir().join("engine-sessions"),
            code_interval_secs: 20,
            auto_pair_secs: None,
        }
    }
}

impl SessionConfig {
    /// Returns the bulk inter-send delay.
    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    /// Returns the stream keep-alive interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pairline")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pairline")
}

/// Reads a non-empty environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PAIRLINE_BIND: Override the HTTP bind address
    /// - PAIRLINE_PORT: Override the HTTP port
    /// - PAIRLINE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PAIRLINE_ENGINE_COMMAND: Override the bridge command
    pub fn apply_env_overrides(&mut self) {
        if let Some(bind) = env_override("PAIRLINE_BIND") {
            tracing::info!("Overriding http.bind from environment: {}", bind);
            self.http.bind = bind;
        }

        if let Some(port) = env_override("PAIRLINE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding http.port from environment: {}", port);
                    self.http.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid PAIRLINE_PORT value: {}", port),
            }
        }

        if let Some(level) = env_override("PAIRLINE_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(command) = env_override("PAIRLINE_ENGINE_COMMAND") {
            tracing::info!("Overriding engine.command from environment: {}", command);
            self.engine.command = command;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.send_delay_ms > 60_000 {
            return Err(ConfigError::InvalidSendDelay(self.session.send_delay_ms));
        }

        if self.session.heartbeat_secs < 1 || self.session.heartbeat_secs > 3600 {
            return Err(ConfigError::InvalidHeartbeat(self.session.heartbeat_secs));
        }

        if self.engine.code_interval_secs < 1 || self.engine.code_interval_secs > 3600 {
            return Err(ConfigError::InvalidCodeInterval(
                self.engine.code_interval_secs,
            ));
        }

        if self.engine.kind == EngineKind::Bridge && self.engine.command.trim().is_empty() {
            return Err(ConfigError::MissingBridgeCommand);
        }

        if self.http.bind.trim().is_empty() {
            return Err(ConfigError::EmptyBind);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Path of the account ledger file inside the data directory.
    pub fn ledger_path(&self) -> PathBuf {
        self.daemon.data_dir.join("accounts.json")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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
