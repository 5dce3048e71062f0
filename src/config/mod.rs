//! Configuration Module
//!
//! TOML configuration for EdgeMQ covering:
//! - Logging
//! - Topic and queue limits
//! - Fan-out behaviour (shared subscription strategy, delivery timeout)
//! - Retained message handling
//! - Metrics endpoint
//! - Environment variable overrides (EDGEMQ__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use metrics::MetricsConfig;

mod metrics;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned())
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
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub limits: LimitsConfig,
    pub dispatch: DispatchConfig,
    pub retain: RetainConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Topic and queue limits. 0 means unbounded everywhere.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum levels in a topic name or filter
    pub max_topic_levels: usize,
    /// Maximum queued messages per offline persistent session
    pub max_queued_messages: usize,
    /// Capacity of each client's outbound delivery channel
    pub outbound_channel_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_topic_levels: 0,
            max_queued_messages: 1000,
            outbound_channel_capacity: 1024,
        }
    }
}

/// How a shared subscription group picks the member that receives a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedStrategy {
    /// Rotate through members in subscription order
    #[default]
    RoundRobin,
    /// Pick a connected member uniformly at random
    Random,
}

/// Fan-out configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub shared_strategy: SharedStrategy,
    /// Upper bound on a single hand-off to a delivery channel (e.g. "250ms").
    /// Unset means hand-offs are never cut short.
    #[serde(with = "humantime_serde")]
    pub delivery_timeout: Option<Duration>,
}

/// Retained message configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetainConfig {
    /// When false, the retain flag is ignored for storage purposes
    pub enabled: bool,
}

impl Default for RetainConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `EDGEMQ__` prefix with double underscores for nesting:
    ///    - `EDGEMQ__LIMITS__MAX_TOPIC_LEVELS=16` overrides `limits.max_topic_levels`
    ///    - `EDGEMQ__DISPATCH__SHARED_STRATEGY=random` overrides `dispatch.shared_strategy`
    ///
    /// A missing file is not an error; defaults and env vars apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "warn")?
            .set_default("limits.max_topic_levels", 0)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.outbound_channel_capacity", 1024)?
            .set_default("dispatch.shared_strategy", "round_robin")?
            .set_default("retain.enabled", true)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "127.0.0.1:9090")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("EDGEMQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                self.log.level
            )));
        }

        if self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "outbound_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if let Some(timeout) = self.dispatch.delivery_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::Validation(
                    "delivery_timeout must be greater than 0 when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}
