//! # Configuration
//!
//! Configuration for the remaster daemon, loaded with precedence:
//! CLI overrides > environment variables > config files > defaults.
//!
//! # Example config file (remaster.toml)
//! ```toml
//! database = "/var/lib/remaster/db"
//! logging  = "stderr"
//! listen   = "127.0.0.1:7433"
//!
//! [entities.customer]
//! enabled = ["acct", "users"]
//!
//! [entities.customer.acct]
//! read   = "curl -fsS https://acct.local/api/%fk"
//! create = "acctctl create"
//! update = "acctctl update %fk"
//! delete = "acctctl delete %fk"
//! ```

use crate::dispatcher::RetryPolicy;
use crate::driver::{DriverRegistry, ShellCommands, ShellDriver};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default listen address for the wire endpoint.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7433";

/// Default dispatcher worker count.
pub const DEFAULT_WORKERS: usize = 4;

/// Default bound on concurrently serviced requests.
pub const DEFAULT_SERVER_REQUESTS: usize = 16;

/// Default per-call driver timeout in milliseconds.
pub const DEFAULT_DRIVER_TIMEOUT_MS: u64 = 30_000;

/// Where structured logs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Stderr,
    Stdout,
    None,
}

impl FromStr for LogTarget {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "stderr" => Ok(LogTarget::Stderr),
            "stdout" => Ok(LogTarget::Stdout),
            "none" => Ok(LogTarget::None),
            other => Err(ConfigError::new(format!(
                "unknown log target {other:?}; expected stderr, stdout, or none"
            ))),
        }
    }
}

/// Backoff tuning for retried cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub attempts: u32,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 300_000,
            attempts: 8,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.base_ms),
            cap: Duration::from_millis(self.cap_ms),
            attempts: self.attempts,
            jitter: self.jitter,
        }
    }
}

/// One entity: which sources participate and their command templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Source names participating in reconciliation, in declaration order.
    pub enabled: Vec<String>,
    /// Per-source shell command templates, keyed by source name.
    #[serde(flatten)]
    pub sources: BTreeMap<String, ShellCommands>,
}

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store connection string; `:memory:` selects the in-memory store,
    /// anything else is a database directory path.
    pub database: String,
    pub logging: LogTarget,
    pub listen: String,
    pub workers: usize,
    pub server_requests: usize,
    pub driver_timeout_ms: u64,
    pub retry: RetryConfig,
    pub entities: BTreeMap<String, EntityConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: ":memory:".to_string(),
            logging: LogTarget::default(),
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            workers: DEFAULT_WORKERS,
            server_requests: DEFAULT_SERVER_REQUESTS,
            driver_timeout_ms: DEFAULT_DRIVER_TIMEOUT_MS,
            retry: RetryConfig::default(),
            entities: BTreeMap::new(),
        }
    }
}

/// CLI overrides applied on top of files and environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LogTarget>,
}

impl Config {
    /// Load configuration with precedence: CLI overrides > env > files >
    /// defaults. Config files merge in argument order, later files winning.
    pub fn load(paths: &[String], overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        for path in paths {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("REMASTER_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));
        let config: Config = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (entity, entity_config) in &self.entities {
            if entity_config.enabled.is_empty() {
                return Err(ConfigError::new(format!(
                    "entity {entity} enables no sources"
                )));
            }
            for source in &entity_config.enabled {
                let commands = entity_config.sources.get(source).ok_or_else(|| {
                    ConfigError::new(format!(
                        "entity {entity} enables {source} but configures no commands for it"
                    ))
                })?;
                if commands.read.is_none() {
                    return Err(ConfigError::new(format!(
                        "{entity}.{source} has no read command"
                    )));
                }
            }
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::new("retry.jitter must be in [0, 1)"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::new(format!("bad listen address {:?}", self.listen)))
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }

    /// Build the driver registry: one shell driver per enabled
    /// (entity, source), registered in declaration order.
    pub fn build_registry(&self) -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        for (entity, entity_config) in &self.entities {
            for source in &entity_config.enabled {
                let commands = entity_config
                    .sources
                    .get(source)
                    .cloned()
                    .unwrap_or_default();
                registry.register(
                    entity.clone(),
                    source.clone(),
                    command_bag(&commands),
                    Arc::new(ShellDriver::new(commands)),
                );
            }
        }
        registry
    }
}

fn command_bag(commands: &ShellCommands) -> HashMap<String, String> {
    let mut bag = HashMap::new();
    for (verb, template) in [
        ("create", &commands.create),
        ("read", &commands.read),
        ("update", &commands.update),
        ("delete", &commands.delete),
    ] {
        if let Some(template) = template {
            bag.insert(verb.to_string(), template.clone());
        }
    }
    bag
}

/// Configuration loading or validation failure.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}
