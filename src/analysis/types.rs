//! Analysis request classification.

use serde::{Deserialize, Serialize};

/// Payloads above this size are always intensive.
pub const INTENSIVE_PAYLOAD_BYTES: usize = 100 * 1024;

/// Kinds of analysis the property API runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    PriceTrend,
    MarketComparison,
    GeographicDistribution,
    AnomalyDetection,
    CorrelationAnalysis,
    TimeSeriesForecast,
    ClusteringAnalysis,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::PriceTrend => "price_trend",
            AnalysisType::MarketComparison => "market_comparison",
            AnalysisType::GeographicDistribution => "geographic_distribution",
            AnalysisType::AnomalyDetection => "anomaly_detection",
            AnalysisType::CorrelationAnalysis => "correlation_analysis",
            AnalysisType::TimeSeriesForecast => "time_series_forecast",
            AnalysisType::ClusteringAnalysis => "clustering_analysis",
        }
    }

    pub fn base_complexity(&self) -> Complexity {
        match self {
            AnalysisType::PriceTrend => Complexity::Simple,
            AnalysisType::MarketComparison | AnalysisType::GeographicDistribution => {
                Complexity::Moderate
            }
            AnalysisType::AnomalyDetection
            | AnalysisType::CorrelationAnalysis
            | AnalysisType::TimeSeriesForecast => Complexity::Complex,
            AnalysisType::ClusteringAnalysis => Complexity::Intensive,
        }
    }
}

/// Cost class of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Intensive,
}

impl Complexity {
    const ORDER: [Complexity; 4] = [
        Complexity::Simple,
        Complexity::Moderate,
        Complexity::Complex,
        Complexity::Intensive,
    ];

    /// Raise by `levels`, saturating at `Intensive`.
    pub fn bump(self, levels: usize) -> Self {
        let index = (self as usize + levels).min(Self::ORDER.len() - 1);
        Self::ORDER[index]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::Intensive => "intensive",
        }
    }
}

/// Request body size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadBucket {
    Small,
    Medium,
    Large,
    Xlarge,
    Massive,
}

impl PayloadBucket {
    pub fn from_size(bytes: usize) -> Self {
        const KB: usize = 1024;
        match bytes {
            b if b < KB => PayloadBucket::Small,
            b if b < 10 * KB => PayloadBucket::Medium,
            b if b < 100 * KB => PayloadBucket::Large,
            b if b < 1024 * KB => PayloadBucket::Xlarge,
            _ => PayloadBucket::Massive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadBucket::Small => "small",
            PayloadBucket::Medium => "medium",
            PayloadBucket::Large => "large",
            PayloadBucket::Xlarge => "xlarge",
            PayloadBucket::Massive => "massive",
        }
    }
}

/// The analysis part of an incoming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub payload_bytes: usize,
    #[serde(default)]
    pub parameter_count: usize,
}

impl AnalysisRequest {
    pub fn new(analysis_type: AnalysisType, payload_bytes: usize, parameter_count: usize) -> Self {
        Self {
            analysis_type,
            payload_bytes,
            parameter_count,
        }
    }

    /// Effective complexity after payload and parameter adjustments.
    pub fn complexity(&self) -> Complexity {
        if self.payload_bytes > INTENSIVE_PAYLOAD_BYTES {
            return Complexity::Intensive;
        }
        let base = self.analysis_type.base_complexity();
        match self.parameter_count {
            n if n > 10 => base.bump(2),
            n if n > 5 => base.bump(1),
            _ => base,
        }
    }

    pub fn payload_bucket(&self) -> PayloadBucket {
        PayloadBucket::from_size(self.payload_bytes)
    }
}

/// How a finished analysis went. Used for statistics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub success: bool,
    pub cache_hit: bool,
}

impl AnalysisOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            cache_hit: false,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            cache_hit: false,
        }
    }

    pub fn cached() -> Self {
        Self {
            success: true,
            cache_hit: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_payload_forces_intensive() {
        let request = AnalysisRequest::new(AnalysisType::CorrelationAnalysis, 150 * 1024, 0);
        assert_eq!(request.complexity(), Complexity::Intensive);
        assert_eq!(request.payload_bucket(), PayloadBucket::Xlarge);

        let boundary = AnalysisRequest::new(AnalysisType::PriceTrend, INTENSIVE_PAYLOAD_BYTES, 0);
        assert_eq!(boundary.complexity(), Complexity::Simple);
    }

    #[test]
    fn test_parameter_bumps_saturate() {
        assert_eq!(
            AnalysisRequest::new(AnalysisType::PriceTrend, 0, 6).complexity(),
            Complexity::Moderate
        );
        assert_eq!(
            AnalysisRequest::new(AnalysisType::PriceTrend, 0, 11).complexity(),
            Complexity::Complex
        );
        assert_eq!(
            AnalysisRequest::new(AnalysisType::AnomalyDetection, 0, 20).complexity(),
            Complexity::Intensive
        );
        assert_eq!(
            AnalysisRequest::new(AnalysisType::MarketComparison, 0, 5).complexity(),
            Complexity::Moderate
        );
    }

    #[test]
    fn test_payload_buckets() {
        assert_eq!(PayloadBucket::from_size(0), PayloadBucket::Small);
        assert_eq!(PayloadBucket::from_size(1024), PayloadBucket::Medium);
        assert_eq!(PayloadBucket::from_size(10 * 1024), PayloadBucket::Large);
        assert_eq!(PayloadBucket::from_size(100 * 1024), PayloadBucket::Xlarge);
        assert_eq!(PayloadBucket::from_size(1024 * 1024), PayloadBucket::Massive);
    }
}
