// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::rabbitmq::binding::Binding;
use crate::rabbitmq::errors::MessagingError;
use crate::rabbitmq::pipeline::DecodePolicy;

/// Points at the configuration file to use instead of the search path.
pub const CONFIG_ENV_VAR: &str = "FEDORA_MESSAGING_CONF";

/// Overrides `amqp_url` from the configuration file.
pub const AMQP_ADDR_ENV_VAR: &str = "AMQP_ADDR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_amqp_url")]
    pub amqp_url: String,
    /// Announced to the broker so connections can be told apart.
    #[serde(default = "default_client_properties")]
    pub client_properties: Map<String, Value>,
    #[serde(default = "default_publish_exchange")]
    pub publish_exchange: String,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default = "default_confirms")]
    pub confirms: bool,
    /// Reconnect attempts for consumers; -1 retries forever.
    #[serde(default = "default_retries")]
    pub retries: i32,
    /// Ceiling for the reconnect interval, in seconds.
    #[serde(default = "default_retry_max_interval")]
    pub retry_max_interval: u64,
    /// 0 means no limit.
    #[serde(default)]
    pub prefetch_count: u16,
    #[serde(default)]
    pub decode_policy: DecodePolicy,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

// Default values
fn default_amqp_url() -> String { "amqp://localhost:5672/%2f".to_string() }
fn default_publish_exchange() -> String { "amq.topic".to_string() }
fn default_confirms() -> bool { true }
fn default_retries() -> i32 { -1 }
fn default_retry_max_interval() -> u64 { 60 }
fn default_log_filter() -> String { "info".to_string() }

fn default_client_properties() -> Map<String, Value> {
    let properties = json!({
        "app": "Unknown",
        "product": "Fedora Messaging with lapin",
        "information": "https://fedora-messaging.readthedocs.io/en/stable/",
        "version": format!("fedora_messaging-{}", env!("CARGO_PKG_VERSION")),
    });
    match properties {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            amqp_url: default_amqp_url(),
            client_properties: default_client_properties(),
            publish_exchange: default_publish_exchange(),
            bindings: Vec::new(),
            confirms: default_confirms(),
            retries: default_retries(),
            retry_max_interval: default_retry_max_interval(),
            prefetch_count: 0,
            decode_policy: DecodePolicy::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Loads the configuration the way the binary and the api module do:
    /// `.env`, then the config file (if any), then environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut settings = match find_config_file(explicit)? {
            Some(path) => Settings::from_file(&path)?,
            None => {
                info!("No configuration file found, using defaults");
                Settings::default()
            }
        };

        settings.apply_overrides(env::var(AMQP_ADDR_ENV_VAR).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let settings = Settings::from_json_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(settings)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Configuration file contains invalid JSON or mistyped fields")
    }

    pub fn apply_overrides(&mut self, amqp_addr: Option<String>) {
        if let Some(url) = amqp_addr.filter(|url| !url.is_empty()) {
            debug!("Using broker URL from {}", AMQP_ADDR_ENV_VAR);
            self.amqp_url = url;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), MessagingError> {
        if self.amqp_url.trim().is_empty() {
            return Err(MessagingError::ConfigError("amqp_url cannot be empty".to_string()));
        }
        if self.retries < -1 {
            return Err(MessagingError::ConfigError(format!(
                "retries must be -1 (unlimited) or at least 0, got {}",
                self.retries
            )));
        }
        if self.retry_max_interval == 0 {
            return Err(MessagingError::ConfigError(
                "retry_max_interval must be at least 1 second".to_string(),
            ));
        }
        if self.publish_exchange.is_empty() {
            return Err(MessagingError::ConfigError("publish_exchange cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_secs(self.retry_max_interval)
    }
}

/// Finds the configuration file. An explicitly named file, either passed in
/// or through `FEDORA_MESSAGING_CONF`, must exist. Otherwise the first of the
/// usual locations that exists wins, and having none is fine.
pub fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
    if let Some(path) = named {
        if path.is_file() {
            return Ok(Some(path));
        }
        return Err(anyhow!("Configuration file {} does not exist", path.display()));
    }

    let mut locations = vec![
        ("Current directory", PathBuf::from("fedora-messaging.json")),
    ];
    if let Some(home_dir) = home::home_dir() {
        locations.push(("Home directory", home_dir.join(".fedora-messaging.json")));
    }
    locations.push(("System configuration", PathBuf::from("/etc/fedora-messaging/config.json")));

    for (location_name, path) in locations {
        if path.is_file() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(Some(path));
        }
    }
    Ok(None)
}
