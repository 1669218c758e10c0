//! Configuration management for Rampart.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::abuse::AbuseConfig;
use crate::analysis::AnalysisConfig;
use crate::error::{RampartError, Result};
use crate::geo::GeoConfig;
use crate::predictive::PredictiveConfig;
use crate::quota::QuotaConfig;
use crate::store::RedisStoreConfig;

/// Environment variable prefix for overrides, e.g. `RAMPART__BACKEND__KIND=redis`.
pub const ENV_PREFIX: &str = "RAMPART";

/// A request budget over a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Requests allowed inside the window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl LimitRule {
    pub const fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    /// Reject zero budgets and zero-length windows.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(RampartError::Config(format!("{}: max_requests must be > 0", name)));
        }
        if self.window_secs == 0 {
            return Err(RampartError::Config(format!("{}: window_secs must be > 0", name)));
        }
        Ok(())
    }
}

/// Main configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RampartConfig {
    /// Counter store selection
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub abuse: AbuseConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub predictive: PredictiveConfig,

    #[serde(default)]
    pub geo: GeoConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Used when `kind` is `redis`
    #[serde(default)]
    pub redis: RedisStoreConfig,
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often counters are swept and idle state is evicted
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-client state idle for longer than this is dropped
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_idle_secs: default_max_idle(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_idle() -> u64 {
    3600
}

impl MaintenanceConfig {
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::seconds(self.max_idle_secs as i64)
    }
}

impl RampartConfig {
    /// Load configuration from an optional YAML file layered with
    /// `RAMPART__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: RampartConfig = builder.build()?.try_deserialize()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: RampartConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RampartError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Lowercase free-form map keys so file and environment sources agree.
    pub fn normalize(&mut self) {
        self.quota.normalize();
        self.geo.normalize();
    }

    /// Check every limit definition. Any failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        self.quota.validate()?;
        self.abuse.validate()?;
        self.analysis.validate()?;
        self.predictive.validate()?;
        self.geo.validate()?;

        if self.maintenance.sweep_interval_secs == 0 {
            return Err(RampartError::Config(
                "maintenance.sweep_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RampartConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend.kind, BackendKind::Memory);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
backend:
  kind: redis
  redis:
    url: redis://cache:6379/
quota:
  burst:
    max_requests: 5
    window_secs: 1
  endpoints:
    "GET /api/Properties":
      max_requests: 50
      window_secs: 60
"#;
        let config = RampartConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Redis);
        assert_eq!(config.backend.redis.url, "redis://cache:6379/");
        assert_eq!(config.backend.redis.key_prefix, "rampart:");
        assert_eq!(config.quota.burst, LimitRule::new(5, 1));
        assert!(config.quota.endpoints.contains_key("get /api/properties"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = r#"
quota:
  global:
    max_requests: 0
    window_secs: 60
"#;
        let err = RampartConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RampartError::Config(_)));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(RampartConfig::from_yaml("quota: [1, 2").is_err());
    }

    #[test]
    fn test_limit_rule_window() {
        assert_eq!(LimitRule::new(10, 90).window(), Duration::seconds(90));
    }
}
