//! Configuration management for the route limiter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Prefix of environment variables overriding file configuration,
/// e.g. `LIMITER__RATE_LIMITING__SWALLOW_ERRORS=true`.
pub const ENV_PREFIX: &str = "LIMITER";

/// Main configuration for the demo service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Whether limits are enforced at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Allow requests through when limit evaluation fails unexpectedly
    #[serde(default)]
    pub swallow_errors: bool,

    /// Storage location, e.g. `memory://`
    #[serde(default = "default_storage_url")]
    pub storage_url: String,

    /// Options passed to the storage constructor
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Window strategy: `fixed-window`, `fixed-window-elastic-expiry` or `moving-window`
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Global limits applied to routes without limits of their own,
    /// e.g. `"1 per hour; 10 per day"`
    #[serde(default)]
    pub global_limits: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            swallow_errors: false,
            storage_url: default_storage_url(),
            storage_options: HashMap::new(),
            strategy: default_strategy(),
            global_limits: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_storage_url() -> String {
    "memory://".to_string()
}

fn default_strategy() -> String {
    "fixed-window".to_string()
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, overridden by `LIMITER__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
