//! Configuration management for the rate limiter.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::ratelimit::LimitRules;

/// Prefix for environment overrides, e.g. `GCRA__STORE__URL`.
pub const ENV_PREFIX: &str = "GCRA";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcraConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limits
    #[serde(default)]
    pub limits: LimitRules,
}

/// Which store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Single-process store. Uses the local clock.
    Memory,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Number of Redis connection managers
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Send pipelined commands one by one instead of as a single batch
    #[serde(default)]
    pub implicit_pipelining: bool,

    /// Prepended to every key the limiter touches
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_url(),
            pool_size: default_pool_size(),
            implicit_pipelining: false,
            key_prefix: String::new(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_pool_size() -> usize {
    4
}

impl GcraConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply `GCRA__*`
    /// environment overrides.
    ///
    /// ```text
    /// GCRA__STORE__BACKEND=memory
    /// GCRA__STORE__POOL_SIZE=8
    /// ```
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&str>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.store.pool_size == 0 {
            return Err(Error::Config("store.pool_size must be > 0".to_string()));
        }
        for name in self.limits.names() {
            if let Some(limit) = self.limits.limit(name) {
                crate::ratelimit::validate(&limit, 1).map_err(|e| {
                    Error::Config(format!("limit '{}': {}", name, e))
                })?;
            }
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
