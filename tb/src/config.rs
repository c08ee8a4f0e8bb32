//! TaskBroker configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rpc::ClientConfig;

/// Main TaskBroker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection settings
    pub broker: BrokerConfig,

    /// RPC client tuning
    pub client: ClientConfig,

    /// Per-task reply timeouts
    pub tasks: TasksConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .taskbroker.yml
        let local_config = PathBuf::from(".taskbroker.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/taskbroker/taskbroker.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskbroker").join("taskbroker.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration and apply `RABBITMQ_*` environment overrides
    pub fn resolve(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load(config_path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Override broker settings from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Override broker settings from `lookup`
    ///
    /// Reads `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`, `RABBITMQ_PASS`,
    /// `RABBITMQ_VHOST` and `RABBITMQ_QUEUE`. Unset variables leave the current
    /// value alone.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let broker = &mut self.broker;
        if let Some(host) = lookup("RABBITMQ_HOST") {
            broker.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            broker.port = port
                .trim()
                .parse()
                .context(format!("Invalid RABBITMQ_PORT: {}", port))?;
        }
        if let Some(username) = lookup("RABBITMQ_USER") {
            broker.username = username;
        }
        if let Some(password) = lookup("RABBITMQ_PASS") {
            broker.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            broker.vhost = vhost;
        }
        if let Some(queue) = lookup("RABBITMQ_QUEUE") {
            broker.queue = queue;
        }
        Ok(())
    }

    /// Render as YAML with the password masked
    pub fn to_redacted_yaml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.broker.password.is_empty() {
            shown.broker.password = REDACTED.to_string();
        }
        serde_yaml::to_string(&shown).context("Failed to serialize config")
    }
}

const REDACTED: &str = "********";

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,

    pub port: u16,

    pub username: String,

    pub password: String,

    /// Virtual host
    pub vhost: String,

    /// Durable work queue the worker consumes
    pub queue: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            queue: "debtor_tasks".to_string(),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI with credentials and vhost percent-encoded
    pub fn uri(&self) -> String {
        self.build_uri(&urlencoding::encode(&self.password))
    }

    /// AMQP URI safe for logs
    pub fn redacted_uri(&self) -> String {
        self.build_uri(REDACTED)
    }

    fn build_uri(&self, password: &str) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            password,
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }
}

/// Reply timeouts for the built-in tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Debtor-registry processing timeout in milliseconds
    #[serde(rename = "register-timeout-ms")]
    pub register_timeout_ms: u64,

    /// Email dispatch timeout in milliseconds
    #[serde(rename = "email-timeout-ms")]
    pub email_timeout_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            register_timeout_ms: 60_000,
            email_timeout_ms: 120_000,
        }
    }
}

impl TasksConfig {
    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn email_timeout(&self) -> Duration {
        Duration::from_millis(self.email_timeout_ms)
    }
}
