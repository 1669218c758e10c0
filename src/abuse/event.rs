//! Observed requests and the incidents derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use super::metrics::AbuseMetrics;
use crate::decision::RequestCategory;

/// A completed request, recorded once its response is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    #[serde(default)]
    pub response_time_ms: f64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
}

impl RequestEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            timestamp,
            endpoint: endpoint.into(),
            method: method.into(),
            status_code,
            response_time_ms: 0.0,
            user_agent: None,
            parameters: BTreeMap::new(),
            source_ip: None,
        }
    }

    pub fn with_response_time_ms(mut self, ms: f64) -> Self {
        self.response_time_ms = ms;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }

    pub fn is_auth(&self) -> bool {
        RequestCategory::from_path(&self.endpoint) == RequestCategory::Auth
    }

    /// An auth request the server rejected.
    pub fn is_failed_auth(&self) -> bool {
        self.is_auth() && matches!(self.status_code, 401 | 403)
    }

    /// Hash of the sorted parameter set, `None` when there are no parameters.
    pub fn parameter_signature(&self) -> Option<u64> {
        if self.parameters.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        // BTreeMap iterates in key order
        self.parameters.hash(&mut hasher);
        Some(hasher.finish())
    }
}

/// Kinds of abuse, in tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseType {
    RapidRequests,
    BruteForce,
    Scraping,
    ApiAbuse,
    SuspiciousPattern,
    ResourceExhaustion,
    DistributedAttack,
}

impl AbuseType {
    pub const ALL: [AbuseType; 7] = [
        AbuseType::RapidRequests,
        AbuseType::BruteForce,
        AbuseType::Scraping,
        AbuseType::ApiAbuse,
        AbuseType::SuspiciousPattern,
        AbuseType::ResourceExhaustion,
        AbuseType::DistributedAttack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseType::RapidRequests => "rapid_requests",
            AbuseType::BruteForce => "brute_force",
            AbuseType::Scraping => "scraping",
            AbuseType::ApiAbuse => "api_abuse",
            AbuseType::SuspiciousPattern => "suspicious_pattern",
            AbuseType::ResourceExhaustion => "resource_exhaustion",
            AbuseType::DistributedAttack => "distributed_attack",
        }
    }
}

/// Severity of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl AbuseLevel {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.9 {
            AbuseLevel::Critical
        } else if confidence >= 0.7 {
            AbuseLevel::High
        } else if confidence >= 0.4 {
            AbuseLevel::Medium
        } else {
            AbuseLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseLevel::Low => "low",
            AbuseLevel::Medium => "medium",
            AbuseLevel::High => "high",
            AbuseLevel::Critical => "critical",
        }
    }
}

/// Action taken in response to an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentAction {
    Logged,
    Throttled,
}

/// A classified abuse signal for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseIncident {
    pub timestamp: DateTime<Utc>,
    pub client: String,
    pub abuse_type: AbuseType,
    pub level: AbuseLevel,
    pub confidence: f64,
    pub metrics: AbuseMetrics,
    pub actions: Vec<IncidentAction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_parameter_signature_ignores_insertion_order() {
        let a = RequestEvent::new(at(), "GET", "/api/search", 200)
            .with_parameter("city", "beijing")
            .with_parameter("page", "2");
        let b = RequestEvent::new(at(), "GET", "/api/search", 200)
            .with_parameter("page", "2")
            .with_parameter("city", "beijing");
        let c = RequestEvent::new(at(), "GET", "/api/search", 200).with_parameter("page", "3");

        assert_eq!(a.parameter_signature(), b.parameter_signature());
        assert_ne!(a.parameter_signature(), c.parameter_signature());
        assert_eq!(RequestEvent::new(at(), "GET", "/", 200).parameter_signature(), None);
    }

    #[test]
    fn test_failed_auth() {
        assert!(RequestEvent::new(at(), "POST", "/auth/login", 401).is_failed_auth());
        assert!(!RequestEvent::new(at(), "POST", "/auth/login", 200).is_failed_auth());
        assert!(!RequestEvent::new(at(), "GET", "/api/listings", 401).is_failed_auth());
    }

    #[test]
    fn test_level_from_confidence() {
        assert_eq!(AbuseLevel::from_confidence(0.95), AbuseLevel::Critical);
        assert_eq!(AbuseLevel::from_confidence(0.7), AbuseLevel::High);
        assert_eq!(AbuseLevel::from_confidence(0.6), AbuseLevel::Medium);
        assert_eq!(AbuseLevel::from_confidence(0.39), AbuseLevel::Low);
    }
}
