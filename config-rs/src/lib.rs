//! config-rs/lib.rs
//! Layered configuration for the intelligence adapter.
//!
//! Values are resolved in this order, later sources winning:
//! 1. Built-in defaults
//! 2. An optional TOML file (`INTELLIGENCE_ADAPTER_CONFIG`, default `intelligence-adapter.toml`)
//! 3. Environment variables such as `INTELLIGENCE_ADAPTER__BACKEND__TIMEOUT_MS`
//!
//! Only the binary calls [`load_config`]. Library code receives an
//! [`AdapterConfig`] value and never reads the environment itself.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "INTELLIGENCE_ADAPTER";

/// Variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "INTELLIGENCE_ADAPTER_CONFIG";

/// File consulted when `INTELLIGENCE_ADAPTER_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "intelligence-adapter.toml";

/// Upper bound on the backend request timeout
pub const MAX_BACKEND_TIMEOUT_MS: u64 = 300_000;

/// Default input topic of the code analysis command stream
pub const DEFAULT_INPUT_TOPIC: &str =
    "dev.archon-intelligence.cmd.omniintelligence.code-analysis-requested.v1";

/// Keys whose list values may be given as comma separated environment strings
const LIST_KEYS: [&str; 2] = ["bus.input_topics", "dead_letter.redacted_keys"];

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Complete adapter configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub service: ServiceSettings,
    pub bus: BusSettings,
    pub consumer: ConsumerSettings,
    pub backend: BackendSettings,
    pub resilience: ResilienceSettings,
    pub publisher: PublisherSettings,
    pub dead_letter: DeadLetterSettings,
    pub logging: LoggingSettings,
}

/// Identity stamped into every published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub name: String,
    pub instance_id: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "intelligence-adapter".to_string(),
            instance_id: default_instance_id(),
        }
    }
}

/// Message bus connection and subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub input_topics: Vec<String>,
    /// Overrides the completed topic derived from the input topic
    pub completed_topic: Option<String>,
    /// Overrides the failed topic derived from the input topic
    pub failed_topic: Option<String>,
    pub poll_batch_size: usize,
    pub poll_timeout_ms: u64,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "intelligence-adapter".to_string(),
            input_topics: vec![DEFAULT_INPUT_TOPIC.to_string()],
            completed_topic: None,
            failed_topic: None,
            poll_batch_size: 50,
            poll_timeout_ms: 500,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30_000,
        }
    }
}

impl BusSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Consumer loop concurrency and shutdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub max_in_flight: usize,
    pub drain_timeout_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 100,
            drain_timeout_ms: 30_000,
        }
    }
}

impl ConsumerSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Intelligence backend endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8053".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker and retry settings applied to each backend route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ResilienceSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Local retry of outbound publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
        }
    }
}

impl PublisherSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Dead letter redaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSettings {
    pub redacted_keys: Vec<String>,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            redacted_keys: [
                "password",
                "secret",
                "token",
                "api_key",
                "apikey",
                "authorization",
                "credential",
                "private_key",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
        }
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
        }
    }
}

impl AdapterConfig {
    /// Checks every bounded value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::invalid("service.name", "must not be empty"));
        }
        if self.service.instance_id.trim().is_empty() {
            return Err(ConfigError::invalid("service.instance_id", "must not be empty"));
        }
        if self.bus.group_id.trim().is_empty() {
            return Err(ConfigError::invalid("bus.group_id", "must not be empty"));
        }
        if self.bus.input_topics.is_empty() {
            return Err(ConfigError::invalid("bus.input_topics", "at least one topic is required"));
        }
        if let Some(topic) = self.bus.input_topics.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "bus.input_topics",
                format!("blank topic name {:?}", topic),
            ));
        }
        if self.bus.poll_batch_size == 0 {
            return Err(ConfigError::invalid("bus.poll_batch_size", "must be at least 1"));
        }
        if self.consumer.max_in_flight == 0 {
            return Err(ConfigError::invalid("consumer.max_in_flight", "must be at least 1"));
        }
        validate_base_url(&self.backend.base_url)?;
        if self.backend.timeout_ms == 0 || self.backend.timeout_ms > MAX_BACKEND_TIMEOUT_MS {
            return Err(ConfigError::invalid(
                "backend.timeout_ms",
                format!(
                    "{} is outside 1..={}",
                    self.backend.timeout_ms, MAX_BACKEND_TIMEOUT_MS
                ),
            ));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(ConfigError::invalid("resilience.failure_threshold", "must be at least 1"));
        }
        if self.resilience.max_delay_ms < self.resilience.base_delay_ms {
            return Err(ConfigError::invalid(
                "resilience.max_delay_ms",
                "must not be lower than resilience.base_delay_ms",
            ));
        }
        if self.publisher.max_attempts == 0 {
            return Err(ConfigError::invalid("publisher.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

fn validate_base_url(url: &str) -> Result<(), ConfigError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| ConfigError::invalid("backend.base_url", format!("{} is not an http(s) URL", url)))?;

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(ConfigError::invalid("backend.base_url", format!("{} has no host", url)));
    }
    Ok(())
}

fn default_instance_id() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Builder over the configuration sources
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<(PathBuf, bool)>,
    toml: Option<String>,
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a TOML file. A missing file is an error only when `required`.
    pub fn with_file(mut self, path: impl Into<PathBuf>, required: bool) -> Self {
        self.file = Some((path.into(), required));
        self
    }

    /// Adds inline TOML, applied after the file
    pub fn with_toml(mut self, content: impl Into<String>) -> Self {
        self.toml = Some(content.into());
        self
    }

    /// Reads overrides from `vars` instead of the process environment
    pub fn with_env_map(mut self, vars: HashMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    /// Resolves and validates the configuration
    pub fn load(self) -> Result<AdapterConfig, ConfigError> {
        let mut builder = Config::builder();

        if let Some((path, required)) = &self.file {
            if !required && !path.exists() {
                debug!(path = %path.display(), "Optional configuration file not found");
            }
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml).required(*required));
        }

        if let Some(content) = &self.toml {
            builder = builder.add_source(File::from_str(content, FileFormat::Toml));
        }

        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .try_parsing(true)
            .source(self.env);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }
        builder = builder.add_source(environment);

        let config: AdapterConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

/// Loads the adapter configuration from `.env`, the configuration file and
/// the process environment.
///
/// # Returns
/// A validated [`AdapterConfig`], or the first source or bound error
pub fn load_config() -> Result<AdapterConfig, ConfigError> {
    if let Err(e) = dotenv::dotenv() {
        debug!("No .env file loaded: {}", e);
    }

    let loader = match env::var(CONFIG_FILE_ENV) {
        Ok(path) => ConfigLoader::new().with_file(path, true),
        Err(env::VarError::NotUnicode(_)) => {
            warn!("{} is not valid unicode, using {}", CONFIG_FILE_ENV, DEFAULT_CONFIG_FILE);
            ConfigLoader::new().with_file(DEFAULT_CONFIG_FILE, false)
        }
        Err(env::VarError::NotPresent) => ConfigLoader::new().with_file(DEFAULT_CONFIG_FILE, false),
    };

    loader.load()
}
