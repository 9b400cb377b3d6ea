//! Configuration Module
//!
//! Provides TOML-based configuration for the inbound path with support for:
//! - Flow control (receive maximum, QoS 0 overflow policy)
//! - Logging
//! - Environment variable overrides (VIBEMQ_INBOUND__* prefix)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("valid pattern");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Inbound flow control
    pub inbound: InboundConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// What happens to a QoS 0 publish that finds the QoS 0 queue full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Qos0Overflow {
    /// Drop the oldest queued publish to make room
    #[default]
    DropOldest,
    /// Drop the incoming publish
    DropNewest,
}

/// Inbound flow control configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Receive maximum announced in CONNECT; bounds unacknowledged QoS 1/2
    /// publishes, and twice this bounds queued QoS 0 publishes
    #[serde(default = "default_receive_maximum")]
    pub receive_maximum: u16,
    #[serde(default)]
    pub qos0_overflow: Qos0Overflow,
    /// Capacity of a spawned session's command channel
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

fn default_receive_maximum() -> u16 {
    65535
}

fn default_command_capacity() -> usize {
    1024
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            receive_maximum: default_receive_maximum(),
            qos0_overflow: Qos0Overflow::default(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable support.
    ///
    /// A missing file yields the defaults. `${VAR}` and `${VAR:-default}` in
    /// the file are substituted, then `VIBEMQ_INBOUND__SECTION__KEY`
    /// variables override individual keys.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("inbound.receive_maximum", 65535)?
            .set_default("inbound.qos0_overflow", "drop-oldest")?
            .set_default("inbound.command_capacity", 1024)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMQ_INBOUND")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inbound.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "receive_maximum must be between 1 and 65535".to_string(),
            ));
        }
        if self.inbound.command_capacity == 0 {
            return Err(ConfigError::Validation(
                "command_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
