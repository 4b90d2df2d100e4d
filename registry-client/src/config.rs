use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_HEARTBEAT_INTERVAL_SECS;
use crate::error::DiscoveryError;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    /// Interval requested at registration; the registry's answer wins
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Cache TTL as a multiple of the shortest heartbeat interval
    #[serde(default = "default_cache_multiplier")]
    pub cache_multiplier: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_registry_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_cache_multiplier() -> f64 {
    1.0
}

fn default_request_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            cache_multiplier: default_cache_multiplier(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self {
            registry_url: registry_url.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    pub fn with_cache_multiplier(mut self, multiplier: f64) -> Self {
        self.cache_multiplier = multiplier;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Reject settings that would silently disable caching.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if !self.cache_multiplier.is_finite() || self.cache_multiplier <= 0.0 {
            return Err(DiscoveryError::InvalidConfig(format!(
                "cache_multiplier must be a positive number, got {}",
                self.cache_multiplier
            )));
        }
        Ok(())
    }
}
