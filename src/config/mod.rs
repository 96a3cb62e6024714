//! Configuration Module
//!
//! TOML-based configuration for the forwarder:
//! - Source and destination broker connections
//! - Per-category filter patterns
//! - Reconnect and status timing
//! - Node registry layout
//! - Environment variable overrides (PCFORWARD__* prefix)

use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::client::{ClientOptions, RegistryOptions};
use crate::filter::{Category, FilterSet};
use crate::forward::ForwardSettings;
use crate::protocol::QoS;
use crate::topic::validate_topic_name;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
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
    /// A filter pattern is not a valid regular expression
    InvalidPattern {
        category: Category,
        source: regex::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "config is not valid TOML: {}", e),
            ConfigError::Config(e) => write!(f, "bad config value: {}", e),
            ConfigError::Validation(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::InvalidPattern { category, source } => {
                write!(f, "{} filter is not a valid regex: {}", category, source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::InvalidPattern { source, .. } => Some(source),
            ConfigError::Validation(_) => None,
        }
    }
}

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
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker events are read from
    pub source: BrokerConfig,
    /// Broker reduced events are written to
    pub destination: BrokerConfig,
    /// Category filter patterns
    pub filter: FilterConfig,
    /// Forwarding behaviour
    pub forward: ForwardConfig,
    /// Node registry layout
    pub registry: RegistryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            source: BrokerConfig {
                server: DEFAULT_SOURCE_SERVER.to_string(),
                node_name: DEFAULT_SOURCE_NODE.to_string(),
                ..BrokerConfig::default()
            },
            destination: BrokerConfig {
                server: DEFAULT_DESTINATION_SERVER.to_string(),
                node_name: DEFAULT_DESTINATION_NODE.to_string(),
                ..BrokerConfig::default()
            },
            filter: FilterConfig::default(),
            forward: ForwardConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

const DEFAULT_SOURCE_SERVER: &str = "127.0.0.1:1883";
const DEFAULT_DESTINATION_SERVER: &str = "127.0.0.1:1884";
const DEFAULT_SOURCE_NODE: &str = "PCForwardSrc";
const DEFAULT_DESTINATION_NODE: &str = "PCForwardDst";

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

/// Connection settings for one broker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Node server (broker) address, host:port
    pub server: String,
    /// Name registered in the broker's node registry
    pub node_name: String,
    /// Channel topic records travel on
    #[serde(default = "default_topic")]
    pub topic: String,
    /// QoS for subscribe and publish (0 or 1)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Keep alive in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,
    /// Timeout for TCP connect plus CONNACK (e.g. "10s")
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Username for broker authentication
    pub username: Option<String>,
    /// Password for broker authentication
    pub password: Option<String>,
}

fn default_topic() -> String {
    "pcounter".to_string()
}
fn default_qos() -> u8 {
    1
}
fn default_keepalive() -> u16 {
    60
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            node_name: String::new(),
            topic: default_topic(),
            qos: default_qos(),
            keepalive: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            username: None,
            password: None,
        }
    }
}

impl BrokerConfig {
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or(QoS::AtLeastOnce)
    }

    /// Client options for a connection with the given role suffix
    pub fn client_options(&self, role: &str) -> ClientOptions {
        ClientOptions {
            client_id: format!("{}-{}-{}", self.node_name, role, std::process::id()),
            keepalive: self.keepalive,
            username: self.username.clone(),
            password: self.password.clone(),
            connect_timeout: self.connect_timeout,
            ..ClientOptions::default()
        }
    }

    fn validate(&self, side: &str) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}.server must not be empty",
                side
            )));
        }
        if self.node_name.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}.node_name must not be empty",
                side
            )));
        }
        if self.qos > 1 {
            return Err(ConfigError::Validation(format!(
                "{}.qos must be 0 or 1",
                side
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(format!(
                "{}.connect_timeout must be greater than zero",
                side
            )));
        }
        validate_topic_name(&self.topic).map_err(|reason| {
            ConfigError::Validation(format!("{}.topic is invalid: {}", side, reason))
        })
    }
}

/// Filter patterns, one regular expression per category.
/// Empty or missing patterns disable the category.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub counter: Option<String>,
    pub fill_level: Option<String>,
    pub dwell_time: Option<String>,
}

impl FilterConfig {
    pub fn compile(&self) -> Result<FilterSet, ConfigError> {
        FilterSet::compile(
            self.counter.as_deref(),
            self.fill_level.as_deref(),
            self.dwell_time.as_deref(),
        )
    }
}

/// Forwarding behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Fixed wait before each source reconnect (e.g. "5s")
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Period of the registry status reports (e.g. "3s")
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
    /// Inbound payload channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Source data server to use instead of the registered one
    pub local: Option<String>,
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_status_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_channel_capacity() -> usize {
    1024
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: default_reconnect_interval(),
            status_interval: default_status_interval(),
            channel_capacity: default_channel_capacity(),
            local: None,
        }
    }
}

impl ForwardConfig {
    pub fn settings(&self) -> ForwardSettings {
        ForwardSettings {
            reconnect_interval: self.reconnect_interval,
            status_interval: self.status_interval,
            channel_capacity: self.channel_capacity,
        }
    }

    /// `local` with empty strings treated as unset
    pub fn local_override(&self) -> Option<&str> {
        self.local.as_deref().filter(|l| !l.is_empty())
    }
}

/// Node registry layout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Topic prefix of the registry documents
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Channel name advertised in registrations
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_topic_prefix() -> String {
    "nodes".to_string()
}
fn default_channel() -> String {
    "pcounter".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            channel: default_channel(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `PCFORWARD__` prefix with double underscores for nesting:
    ///    - `PCFORWARD__SOURCE__SERVER=10.0.0.1:1883` overrides `source.server`
    ///    - `PCFORWARD__FILTER__COUNTER=^gate-` overrides `filter.counter`
    ///    - `PCFORWARD__FORWARD__RECONNECT_INTERVAL=10s` overrides `forward.reconnect_interval`
    ///
    /// The result is not validated; call [`Config::validate`] once command
    /// line overrides have been applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Self::builder_with_defaults()?;

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
                Environment::with_prefix("PCFORWARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Load configuration with environment variable overrides only (no file)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        // Syntax errors surface as toml errors rather than config crate errors
        toml::from_str::<toml::Table>(content)?;

        let cfg = Self::builder_with_defaults()?
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;
        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("source.server", DEFAULT_SOURCE_SERVER)?
            .set_default("source.node_name", DEFAULT_SOURCE_NODE)?
            .set_default("destination.server", DEFAULT_DESTINATION_SERVER)?
            .set_default("destination.node_name", DEFAULT_DESTINATION_NODE)?
            .set_default("forward.reconnect_interval", "5s")?
            .set_default("forward.status_interval", "3s")?
            .set_default("forward.channel_capacity", 1024)?
            .set_default("registry.topic_prefix", "nodes")?
            .set_default("registry.channel", "pcounter")?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.server == self.destination.server {
            return Err(ConfigError::Validation(format!(
                "source and destination servers must differ (both are {})",
                self.source.server
            )));
        }

        self.source.validate("source")?;
        self.destination.validate("destination")?;

        if self.forward.reconnect_interval.is_zero() {
            return Err(ConfigError::Validation(
                "forward.reconnect_interval must be greater than zero".to_string(),
            ));
        }
        if self.forward.status_interval.is_zero() {
            return Err(ConfigError::Validation(
                "forward.status_interval must be greater than zero".to_string(),
            ));
        }
        if self.forward.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "forward.channel_capacity must be greater than zero".to_string(),
            ));
        }

        if self.registry.topic_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "registry.topic_prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Registry options for the source broker; carries the `local` override
    pub fn source_registry(&self) -> RegistryOptions {
        RegistryOptions {
            server: self.source.server.clone(),
            node_name: self.source.node_name.clone(),
            channel: self.registry.channel.clone(),
            topic_prefix: self.registry.topic_prefix.clone(),
            local: self.forward.local_override().map(String::from),
            client: self.source.client_options("registry"),
        }
    }

    /// Registry options for the destination broker
    pub fn destination_registry(&self) -> RegistryOptions {
        RegistryOptions {
            server: self.destination.server.clone(),
            node_name: self.destination.node_name.clone(),
            channel: self.registry.channel.clone(),
            topic_prefix: self.registry.topic_prefix.clone(),
            local: None,
            client: self.destination.client_options("registry"),
        }
    }
}
