//! Analysis limiter configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::types::{AnalysisType, Complexity, PayloadBucket};
use crate::config::LimitRule;
use crate::error::{RampartError, Result};
use crate::identity::ClientTier;

/// Window limit plus in-flight cap for one complexity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityRule {
    #[serde(flatten)]
    pub limit: LimitRule,
    pub max_concurrent: usize,
}

impl ComplexityRule {
    pub const fn new(max_requests: u64, window_secs: u64, max_concurrent: usize) -> Self {
        Self {
            limit: LimitRule::new(max_requests, window_secs),
            max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityLimits {
    pub simple: ComplexityRule,
    pub moderate: ComplexityRule,
    pub complex: ComplexityRule,
    pub intensive: ComplexityRule,
}

impl Default for ComplexityLimits {
    fn default() -> Self {
        Self {
            simple: ComplexityRule::new(100, 60, 10),
            moderate: ComplexityRule::new(30, 60, 5),
            complex: ComplexityRule::new(10, 60, 2),
            intensive: ComplexityRule::new(3, 300, 1),
        }
    }
}

impl ComplexityLimits {
    pub fn get(&self, complexity: Complexity) -> ComplexityRule {
        match complexity {
            Complexity::Simple => self.simple,
            Complexity::Moderate => self.moderate,
            Complexity::Complex => self.complex,
            Complexity::Intensive => self.intensive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeLimits {
    pub price_trend: LimitRule,
    pub market_comparison: LimitRule,
    pub geographic_distribution: LimitRule,
    pub anomaly_detection: LimitRule,
    pub correlation_analysis: LimitRule,
    pub time_series_forecast: LimitRule,
    pub clustering_analysis: LimitRule,
}

impl Default for TypeLimits {
    fn default() -> Self {
        Self {
            price_trend: LimitRule::new(60, 60),
            market_comparison: LimitRule::new(30, 60),
            geographic_distribution: LimitRule::new(30, 60),
            anomaly_detection: LimitRule::new(20, 60),
            correlation_analysis: LimitRule::new(15, 60),
            time_series_forecast: LimitRule::new(15, 60),
            clustering_analysis: LimitRule::new(5, 60),
        }
    }
}

impl TypeLimits {
    pub fn get(&self, analysis_type: AnalysisType) -> LimitRule {
        match analysis_type {
            AnalysisType::PriceTrend => self.price_trend,
            AnalysisType::MarketComparison => self.market_comparison,
            AnalysisType::GeographicDistribution => self.geographic_distribution,
            AnalysisType::AnomalyDetection => self.anomaly_detection,
            AnalysisType::CorrelationAnalysis => self.correlation_analysis,
            AnalysisType::TimeSeriesForecast => self.time_series_forecast,
            AnalysisType::ClusteringAnalysis => self.clustering_analysis,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadLimits {
    pub small: LimitRule,
    pub medium: LimitRule,
    pub large: LimitRule,
    pub xlarge: LimitRule,
    pub massive: LimitRule,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            small: LimitRule::new(100, 60),
            medium: LimitRule::new(50, 60),
            large: LimitRule::new(20, 60),
            xlarge: LimitRule::new(5, 60),
            massive: LimitRule::new(1, 300),
        }
    }
}

impl PayloadLimits {
    pub fn get(&self, bucket: PayloadBucket) -> LimitRule {
        match bucket {
            PayloadBucket::Small => self.small,
            PayloadBucket::Medium => self.medium,
            PayloadBucket::Large => self.large,
            PayloadBucket::Xlarge => self.xlarge,
            PayloadBucket::Massive => self.massive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimits {
    pub default: LimitRule,
    pub premium: LimitRule,
    pub admin: LimitRule,
    pub system: LimitRule,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            default: LimitRule::new(100, 3600),
            premium: LimitRule::new(1000, 3600),
            admin: LimitRule::new(5000, 3600),
            system: LimitRule::new(20_000, 3600),
        }
    }
}

impl TierLimits {
    pub fn get(&self, tier: ClientTier) -> LimitRule {
        match tier {
            ClientTier::Default => self.default,
            ClientTier::Premium => self.premium,
            ClientTier::Admin => self.admin,
            ClientTier::System => self.system,
        }
    }
}

/// Analysis limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub complexity: ComplexityLimits,

    #[serde(default)]
    pub types: TypeLimits,

    #[serde(default)]
    pub payload: PayloadLimits,

    #[serde(default)]
    pub tiers: TierLimits,

    /// How long a denial marks a client as recently throttled
    #[serde(default = "default_throttle_memory")]
    pub throttle_memory_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            complexity: ComplexityLimits::default(),
            types: TypeLimits::default(),
            payload: PayloadLimits::default(),
            tiers: TierLimits::default(),
            throttle_memory_secs: default_throttle_memory(),
        }
    }
}

fn default_throttle_memory() -> u64 {
    60
}

impl AnalysisConfig {
    pub fn throttle_memory(&self) -> Duration {
        Duration::seconds(self.throttle_memory_secs as i64)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, rule) in [
            ("simple", self.complexity.simple),
            ("moderate", self.complexity.moderate),
            ("complex", self.complexity.complex),
            ("intensive", self.complexity.intensive),
        ] {
            rule.limit.validate(&format!("analysis.complexity.{}", name))?;
            if rule.max_concurrent == 0 {
                return Err(RampartError::Config(format!(
                    "analysis.complexity.{}: max_concurrent must be > 0",
                    name
                )));
            }
        }

        let t = &self.types;
        for (name, rule) in [
            ("price_trend", t.price_trend),
            ("market_comparison", t.market_comparison),
            ("geographic_distribution", t.geographic_distribution),
            ("anomaly_detection", t.anomaly_detection),
            ("correlation_analysis", t.correlation_analysis),
            ("time_series_forecast", t.time_series_forecast),
            ("clustering_analysis", t.clustering_analysis),
        ] {
            rule.validate(&format!("analysis.types.{}", name))?;
        }

        let p = &self.payload;
        for (name, rule) in [
            ("small", p.small),
            ("medium", p.medium),
            ("large", p.large),
            ("xlarge", p.xlarge),
            ("massive", p.massive),
        ] {
            rule.validate(&format!("analysis.payload.{}", name))?;
        }

        let tiers = &self.tiers;
        for (name, rule) in [
            ("default", tiers.default),
            ("premium", tiers.premium),
            ("admin", tiers.admin),
            ("system", tiers.system),
        ] {
            rule.validate(&format!("analysis.tiers.{}", name))?;
        }
        Ok(())
    }
}
