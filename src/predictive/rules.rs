//! Predictive limiter configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::models::PredictionModel;
use crate::decision::RequestCategory;
use crate::error::{RampartError, Result};

/// How the dynamic limit becomes an admission threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStrategy {
    Conservative,
    Aggressive,
    Adaptive,
    Balanced,
}

impl LimitStrategy {
    pub fn threshold(&self, limit: f64, confidence: f64) -> f64 {
        match self {
            LimitStrategy::Conservative => 0.8 * limit,
            LimitStrategy::Aggressive => 1.2 * limit,
            LimitStrategy::Adaptive => (0.7 + 0.5 * confidence) * limit,
            LimitStrategy::Balanced => limit,
        }
    }
}

/// Predictive limit for one request category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveRule {
    pub base_limit: u64,
    pub window_secs: u64,
    pub min_limit: u64,
    pub max_limit: u64,
    pub model: PredictionModel,
    pub strategy: LimitStrategy,
    #[serde(default = "default_adjustment")]
    pub adjustment_factor: f64,
}

fn default_adjustment() -> f64 {
    1.0
}

impl PredictiveRule {
    pub fn new(
        base_limit: u64,
        window_secs: u64,
        model: PredictionModel,
        strategy: LimitStrategy,
    ) -> Self {
        Self {
            base_limit,
            window_secs,
            min_limit: (base_limit / 4).max(1),
            max_limit: base_limit * 3,
            model,
            strategy,
            adjustment_factor: 1.0,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    /// `base × adjustment × behavior × trust × (0.8 + 0.4·confidence)`,
    /// clamped to `[min_limit, max_limit]`.
    pub fn dynamic_limit(&self, behavior_multiplier: f64, trust: f64, confidence: f64) -> f64 {
        let raw = self.base_limit as f64
            * self.adjustment_factor
            * behavior_multiplier
            * trust
            * (0.8 + 0.4 * confidence);
        raw.clamp(self.min_limit as f64, self.max_limit as f64)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.base_limit == 0 || self.window_secs == 0 || self.min_limit == 0 {
            return Err(RampartError::Config(format!(
                "{}: base_limit, window_secs and min_limit must be > 0",
                name
            )));
        }
        if self.min_limit > self.max_limit {
            return Err(RampartError::Config(format!(
                "{}: min_limit {} exceeds max_limit {}",
                name, self.min_limit, self.max_limit
            )));
        }
        if self.adjustment_factor.is_nan() || self.adjustment_factor <= 0.0 {
            return Err(RampartError::Config(format!(
                "{}: adjustment_factor must be > 0",
                name
            )));
        }
        Ok(())
    }
}

/// Predictive limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Rule for categories without their own
    #[serde(default = "default_rule")]
    pub default_rule: PredictiveRule,

    #[serde(default = "default_categories")]
    pub categories: BTreeMap<RequestCategory, PredictiveRule>,

    /// Width of the buckets the series models work on
    #[serde(default = "default_bucket")]
    pub bucket_secs: u64,

    /// Window of the shared per-category rate used by the seasonal model
    #[serde(default = "default_category_window")]
    pub category_window_secs: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_initial_trust")]
    pub initial_trust: f64,

    /// Profiles kept before the least recently active is evicted
    #[serde(default = "default_max_profiles")]
    pub max_profiles: usize,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_rule: default_rule(),
            categories: default_categories(),
            bucket_secs: default_bucket(),
            category_window_secs: default_category_window(),
            history_capacity: default_history_capacity(),
            initial_trust: default_initial_trust(),
            max_profiles: default_max_profiles(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_rule() -> PredictiveRule {
    PredictiveRule::new(120, 60, PredictionModel::MovingAverage, LimitStrategy::Balanced)
}

fn default_categories() -> BTreeMap<RequestCategory, PredictiveRule> {
    BTreeMap::from([
        (
            RequestCategory::Search,
            PredictiveRule::new(
                60,
                60,
                PredictionModel::ExponentialSmoothing,
                LimitStrategy::Adaptive,
            ),
        ),
        (
            RequestCategory::Analysis,
            PredictiveRule::new(
                20,
                60,
                PredictionModel::LinearRegression,
                LimitStrategy::Conservative,
            ),
        ),
        (
            RequestCategory::Export,
            PredictiveRule::new(10, 300, PredictionModel::Seasonal, LimitStrategy::Conservative),
        ),
        (
            RequestCategory::Api,
            PredictiveRule::new(
                300,
                60,
                PredictionModel::AdaptiveThreshold,
                LimitStrategy::Aggressive,
            ),
        ),
    ])
}

fn default_bucket() -> u64 {
    60
}

fn default_category_window() -> u64 {
    300
}

fn default_history_capacity() -> usize {
    1000
}

fn default_initial_trust() -> f64 {
    1.0
}

fn default_max_profiles() -> usize {
    50_000
}

impl PredictiveConfig {
    pub fn rule_for(&self, category: RequestCategory) -> &PredictiveRule {
        self.categories.get(&category).unwrap_or(&self.default_rule)
    }

    pub fn bucket(&self) -> Duration {
        Duration::seconds(self.bucket_secs as i64)
    }

    pub fn category_window(&self) -> Duration {
        Duration::seconds(self.category_window_secs as i64)
    }

    pub fn validate(&self) -> Result<()> {
        self.default_rule.validate("predictive.default_rule")?;
        for (category, rule) in &self.categories {
            rule.validate(&format!("predictive.categories.{}", category.as_str()))?;
        }
        if self.bucket_secs == 0 || self.category_window_secs == 0 {
            return Err(RampartError::Config(
                "predictive: bucket_secs and category_window_secs must be > 0".to_string(),
            ));
        }
        if self.history_capacity == 0 || self.max_profiles == 0 {
            return Err(RampartError::Config(
                "predictive: history_capacity and max_profiles must be > 0".to_string(),
            ));
        }
        if !(0.1..=1.0).contains(&self.initial_trust) {
            return Err(RampartError::Config(
                "predictive.initial_trust must be within [0.1, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}
