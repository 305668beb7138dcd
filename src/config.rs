//! Configuration management for Scopekeeper
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{Result, ScopekeeperError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Longest accepted session time-to-live, one year
pub const MAX_SESSION_DURATION_MINUTES: u64 = 60 * 24 * 365;

/// Longest accepted sweep interval, one day
pub const MAX_SWEEP_INTERVAL_MINUTES: u64 = 60 * 24;

/// Main configuration structure for Scopekeeper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Session lifetime and request binding settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Background expiration sweep settings
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Fan-out settings for order processing
    #[serde(default)]
    pub fanout: FanoutConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (host:port)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Time-to-live after the last lookup, in minutes
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: u64,

    /// Request header carrying the session id
    #[serde(default = "default_header_name")]
    pub header_name: String,

    /// Path prefixes that are never bound to a session (case-insensitive)
    #[serde(default = "default_bypass_prefixes")]
    pub bypass_prefixes: Vec<String>,

    /// Flag sessions created by the middleware to end as soon as their last
    /// scope is released
    #[serde(default)]
    pub expire_new_sessions_immediately: bool,
}

fn default_duration_minutes() -> u64 {
    60
}

fn default_header_name() -> String {
    "X-Session-Id".to_string()
}

fn default_bypass_prefixes() -> Vec<String> {
    ["/health", "/docs", "/swagger", "/auth"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_duration_minutes: default_duration_minutes(),
            header_name: default_header_name(),
            bypass_prefixes: default_bypass_prefixes(),
            expire_new_sessions_immediately: false,
        }
    }
}

impl SessionConfig {
    /// Default session time-to-live
    ///
    /// Values above [`MAX_SESSION_DURATION_MINUTES`] are clamped to it.
    pub fn default_duration(&self) -> chrono::Duration {
        let minutes = self
            .default_duration_minutes
            .min(MAX_SESSION_DURATION_MINUTES);
        chrono::Duration::minutes(minutes as i64)
    }
}

/// Expiration sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Minutes between sweeps
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Maximum number of sessions ended concurrently by one sweep
    #[serde(default = "default_max_concurrent_cleanups")]
    pub max_concurrent_cleanups: usize,
}

fn default_interval_minutes() -> u64 {
    5
}

fn default_max_concurrent_cleanups() -> usize {
    4
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            max_concurrent_cleanups: default_max_concurrent_cleanups(),
        }
    }
}

impl SweeperConfig {
    /// Sweep interval
    ///
    /// Values above [`MAX_SWEEP_INTERVAL_MINUTES`] are clamped to it.
    pub fn interval(&self) -> std::time::Duration {
        let minutes = self.interval_minutes.min(MAX_SWEEP_INTERVAL_MINUTES);
        std::time::Duration::from_secs(minutes.saturating_mul(60))
    }
}

/// Fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Maximum number of items in flight per fan-out
    #[serde(default = "default_max_degree_of_parallelism")]
    pub max_degree_of_parallelism: usize,
}

fn default_max_degree_of_parallelism() -> usize {
    4
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: default_max_degree_of_parallelism(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Optional file to write logs to, in addition to stdout
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and CLI
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default_config()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ScopekeeperError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ScopekeeperError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            sweeper: SweeperConfig::default(),
            fanout: FanoutConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    fn apply_env_vars(&mut self) {
        if let Ok(bind) = std::env::var("SCOPEKEEPER_BIND_ADDRESS") {
            self.server.bind_address = bind;
        }

        if let Ok(minutes) = std::env::var("SCOPEKEEPER_SESSION_DURATION_MINUTES") {
            if let Ok(value) = minutes.parse() {
                self.session.default_duration_minutes = value;
            } else {
                tracing::warn!("Invalid SCOPEKEEPER_SESSION_DURATION_MINUTES: {}", minutes);
            }
        }

        if let Ok(prefixes) = std::env::var("SCOPEKEEPER_BYPASS_PREFIXES") {
            self.session.bypass_prefixes = prefixes
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(interval) = std::env::var("SCOPEKEEPER_SWEEP_INTERVAL_MINUTES") {
            if let Ok(value) = interval.parse() {
                self.sweeper.interval_minutes = value;
            } else {
                tracing::warn!("Invalid SCOPEKEEPER_SWEEP_INTERVAL_MINUTES: {}", interval);
            }
        }

        if let Ok(cleanups) = std::env::var("SCOPEKEEPER_MAX_CONCURRENT_CLEANUPS") {
            if let Ok(value) = cleanups.parse() {
                self.sweeper.max_concurrent_cleanups = value;
            } else {
                tracing::warn!("Invalid SCOPEKEEPER_MAX_CONCURRENT_CLEANUPS: {}", cleanups);
            }
        }

        if let Ok(parallelism) = std::env::var("SCOPEKEEPER_MAX_PARALLELISM") {
            if let Ok(value) = parallelism.parse() {
                self.fanout.max_degree_of_parallelism = value;
            } else {
                tracing::warn!("Invalid SCOPEKEEPER_MAX_PARALLELISM: {}", parallelism);
            }
        }

        if let Ok(level) = std::env::var("SCOPEKEEPER_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("SCOPEKEEPER_JSON_LOGS") {
            match json.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.logging.json_format = true,
                "0" | "false" | "no" => self.logging.json_format = false,
                _ => tracing::warn!("Invalid SCOPEKEEPER_JSON_LOGS: {}", json),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }

        if let crate::cli::Commands::Serve {
            bind: Some(bind), ..
        } = &cli.command
        {
            self.server.bind_address = bind.clone();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ScopekeeperError::Config(format!(
                "Invalid bind address: {}",
                self.server.bind_address
            ))
            .into());
        }

        if self.session.default_duration_minutes == 0 {
            return Err(ScopekeeperError::Config(
                "session.default_duration_minutes must be greater than 0".to_string(),
            )
            .into());
        }

        if self.session.default_duration_minutes > MAX_SESSION_DURATION_MINUTES {
            return Err(ScopekeeperError::Config(format!(
                "session.default_duration_minutes must be at most {}",
                MAX_SESSION_DURATION_MINUTES
            ))
            .into());
        }

        if axum::http::HeaderName::from_bytes(self.session.header_name.as_bytes()).is_err() {
            return Err(ScopekeeperError::Config(format!(
                "Invalid session header name: {}",
                self.session.header_name
            ))
            .into());
        }

        if let Some(prefix) = self
            .session
            .bypass_prefixes
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(ScopekeeperError::Config(format!(
                "Bypass prefix must start with '/': {}",
                prefix
            ))
            .into());
        }

        if self.sweeper.interval_minutes == 0 {
            return Err(ScopekeeperError::Config(
                "sweeper.interval_minutes must be greater than 0".to_string(),
            )
            .into());
        }

        if self.sweeper.interval_minutes > MAX_SWEEP_INTERVAL_MINUTES {
            return Err(ScopekeeperError::Config(format!(
                "sweeper.interval_minutes must be at most {}",
                MAX_SWEEP_INTERVAL_MINUTES
            ))
            .into());
        }

        if self.sweeper.max_concurrent_cleanups == 0 {
            return Err(ScopekeeperError::Config(
                "sweeper.max_concurrent_cleanups must be greater than 0".to_string(),
            )
            .into());
        }

        if self.fanout.max_degree_of_parallelism == 0 {
            return Err(ScopekeeperError::Config(
                "fanout.max_degree_of_parallelism must be greater than 0".to_string(),
            )
            .into());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ScopekeeperError::Config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ))
            .into());
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
