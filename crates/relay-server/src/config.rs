//! Configuration for the Relay server
//!
//! Settings are read from an optional file (`RELAY_CONFIG`, default
//! `relay.toml`) and then overridden by `RELAY_*` environment variables.
//! Nested keys use `__`, e.g. `RELAY_ENGINE__MAX_PASSES=500`.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use tracing::{info, warn};

use relay_core::EngineConfig;

use crate::error::{ServerError, ServerResult};

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Log level, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// State store URL: `memory://` or a `postgres://` connection string
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Base URL of the outbound service gateway; in-process dispatch when absent
    #[serde(default)]
    pub service_url: Option<String>,

    /// Secrets by owner (task ID), then name
    #[serde(default)]
    pub secrets: HashMap<String, HashMap<String, String>>,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_url() -> String {
    "memory://".to_string()
}

impl ServerConfig {
    /// Load configuration from the config file and environment variables
    pub fn load() -> ServerResult<Self> {
        let path = env::var("RELAY_CONFIG").unwrap_or_else(|_| "relay.toml".to_string());
        let settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        info!(path = %path, store_url = %config.redacted_store_url(), "Loaded server configuration");
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> ServerResult<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ServerResult<()> {
        if !self.store_url.starts_with("memory://")
            && !self.store_url.starts_with("postgres://")
            && !self.store_url.starts_with("postgresql://")
        {
            return Err(ServerError::ConfigError(format!(
                "Unsupported store URL: {}",
                self.store_url
            )));
        }
        if self.engine.max_passes == 0 {
            return Err(ServerError::ConfigError(
                "engine.max_passes must be positive".to_string(),
            ));
        }
        if self.service_url.is_none() {
            warn!("No service_url configured - outbound services are dispatched in-process");
        }
        Ok(())
    }

    /// Store URL with any password removed, for logging
    pub fn redacted_store_url(&self) -> String {
        match (self.store_url.find("://"), self.store_url.rfind('@')) {
            (Some(scheme), Some(at)) if at > scheme => {
                let credentials = &self.store_url[scheme + 3..at];
                let user = credentials.split(':').next().unwrap_or_default();
                format!("{}{}:***{}", &self.store_url[..scheme + 3], user, &self.store_url[at..])
            }
            _ => self.store_url.clone(),
        }
    }

    /// Socket address to bind
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            log_level: default_log_level(),
            store_url: default_store_url(),
            service_url: None,
            secrets: HashMap::new(),
            engine: EngineConfig::default(),
        }
    }
}
