//! Abuse detector configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::event::AbuseLevel;
use crate::config::LimitRule;
use crate::error::{RampartError, Result};

/// Values at which each abuse type scores `0.6`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseThresholds {
    pub rapid_requests_per_minute: f64,
    pub auth_failure_rate: f64,
    /// Auth attempts needed before brute force is considered
    pub min_auth_attempts: u64,
    pub unique_endpoints: usize,
    pub parameter_variations: usize,
    pub error_rate: f64,
    /// Requests needed before error rate and response time are considered
    pub min_requests: u64,
    pub user_agent_switches: usize,
    pub slow_response_ms: f64,
    pub distributed_clients: usize,
}

impl Default for AbuseThresholds {
    fn default() -> Self {
        Self {
            rapid_requests_per_minute: 50.0,
            auth_failure_rate: 0.8,
            min_auth_attempts: 3,
            unique_endpoints: 20,
            parameter_variations: 15,
            error_rate: 0.5,
            min_requests: 10,
            user_agent_switches: 3,
            slow_response_ms: 5000.0,
            distributed_clients: 10,
        }
    }
}

/// Request limits applied once a client has been classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelLimits {
    pub low: LimitRule,
    pub medium: LimitRule,
    pub high: LimitRule,
    pub critical: LimitRule,
}

impl Default for LevelLimits {
    fn default() -> Self {
        Self {
            low: LimitRule::new(50, 300),
            medium: LimitRule::new(20, 300),
            high: LimitRule::new(5, 300),
            critical: LimitRule::new(1, 600),
        }
    }
}

impl LevelLimits {
    pub fn get(&self, level: AbuseLevel) -> LimitRule {
        match level {
            AbuseLevel::Low => self.low,
            AbuseLevel::Medium => self.medium,
            AbuseLevel::High => self.high,
            AbuseLevel::Critical => self.critical,
        }
    }

    /// The widest window across levels.
    pub fn retention(&self) -> Duration {
        [self.low, self.medium, self.high, self.critical]
            .iter()
            .map(|rule| rule.window())
            .max()
            .unwrap_or_else(|| Duration::seconds(600))
    }
}

/// Abuse detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// Window the metrics are computed over
    #[serde(default = "default_analysis_window")]
    pub analysis_window_secs: u64,

    /// How long events are kept in a client's history
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Maximum events kept per client
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// How long a full metric computation can be reused
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Bound on the shared parameter-signature map
    #[serde(default = "default_max_signatures")]
    pub max_tracked_signatures: usize,

    #[serde(default)]
    pub thresholds: AbuseThresholds,

    #[serde(default)]
    pub level_limits: LevelLimits,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            analysis_window_secs: default_analysis_window(),
            retention_secs: default_retention(),
            history_capacity: default_history_capacity(),
            cache_ttl_secs: default_cache_ttl(),
            max_tracked_signatures: default_max_signatures(),
            thresholds: AbuseThresholds::default(),
            level_limits: LevelLimits::default(),
        }
    }
}

fn default_analysis_window() -> u64 {
    300
}

fn default_retention() -> u64 {
    3600
}

fn default_history_capacity() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_max_signatures() -> usize {
    10_000
}

impl AbuseConfig {
    pub fn analysis_window(&self) -> Duration {
        Duration::seconds(self.analysis_window_secs as i64)
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(self.retention_secs as i64)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis_window_secs == 0 || self.retention_secs < self.analysis_window_secs {
            return Err(RampartError::Config(
                "abuse: retention_secs must be >= analysis_window_secs > 0".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(RampartError::Config(
                "abuse.history_capacity must be > 0".to_string(),
            ));
        }
        self.level_limits.low.validate("abuse.level_limits.low")?;
        self.level_limits.medium.validate("abuse.level_limits.medium")?;
        self.level_limits.high.validate("abuse.level_limits.high")?;
        self.level_limits.critical.validate("abuse.level_limits.critical")?;

        let t = &self.thresholds;
        if t.rapid_requests_per_minute <= 0.0
            || t.auth_failure_rate <= 0.0
            || t.error_rate <= 0.0
            || t.slow_response_ms <= 0.0
            || t.unique_endpoints == 0
            || t.parameter_variations == 0
            || t.user_agent_switches == 0
            || t.distributed_clients == 0
        {
            return Err(RampartError::Config(
                "abuse.thresholds must all be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
