//! Orchestrator configuration.
//!
//! Loaded from a TOML file at [`crate::Orchestrator::initialize`] time.
//! Every section rejects unrecognized keys: a typo in the file is a
//! configuration error, not a silently-ignored option.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use cohort_core::resources::ResourceConfig;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML (includes unrecognized options).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but the values do not make sense together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Certificate paths for mutual authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// One named resource bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub max_tokens: u32,
    pub refill_rate_per_sec: u32,
    pub burst: u32,
    pub refill_interval_ms: u64,
}

/// A per-(agent type, resource) token ceiling, applied to every agent of
/// that type at registration time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaEntry {
    pub agent_type: String,
    pub resource_type: String,
    pub max: u32,
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

/// Recognized configuration options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Address the bus listens on. Omit to run the bus in-process only.
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Required whenever `bind_address` is set or remote agents register.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub resources: Vec<ResourceEntry>,

    #[serde(default)]
    pub quotas: Vec<QuotaEntry>,

    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub expiration_sweep_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            tls: None,
            resources: Vec::new(),
            quotas: Vec::new(),
            default_step_timeout_ms: default_step_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            expiration_sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.is_some() && self.tls.is_none() {
            return Err(ConfigError::Invalid(
                "bind_address requires a [tls] section for mutual authentication".into(),
            ));
        }
        for resource in &self.resources {
            if resource.max_tokens == 0 {
                return Err(ConfigError::Invalid(format!(
                    "resource '{}' has zero max_tokens",
                    resource.resource_type
                )));
            }
        }
        Ok(())
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn expiration_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiration_sweep_interval_ms)
    }

    /// Bucket configurations for the resource manager.
    pub fn resource_configs(&self) -> Vec<ResourceConfig> {
        self.resources
            .iter()
            .map(|entry| ResourceConfig {
                resource_type: entry.resource_type.clone(),
                max_tokens: entry.max_tokens,
                refill_rate: entry.refill_rate_per_sec,
                burst_size: entry.burst,
                refill_interval: Duration::from_millis(entry.refill_interval_ms),
            })
            .collect()
    }
}
