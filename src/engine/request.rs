//! Engine inputs and outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::analysis::{AnalysisRequest, AnalysisTicket};
use crate::decision::{Decision, RequestCategory};
use crate::identity::{ClientIdentity, IdentityKind};
use crate::quota::route_pattern;

fn default_method() -> String {
    "GET".to_string()
}

/// A request awaiting admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Client key such as `ip:10.0.0.1` or `user:42`
    pub client: String,

    #[serde(default = "default_method")]
    pub method: String,

    pub path: String,

    #[serde(default)]
    pub source_ip: Option<IpAddr>,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Present when the request asks for an analysis
    #[serde(default)]
    pub analysis: Option<AnalysisRequest>,
}

impl AdmissionRequest {
    pub fn new(client: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            method: method.into(),
            path: path.into(),
            source_ip: None,
            user_agent: None,
            parameters: BTreeMap::new(),
            analysis: None,
        }
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
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

    pub fn with_analysis(mut self, analysis: AnalysisRequest) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// The client identity. Malformed keys become unverified identities.
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::parse_lenient(&self.client)
    }

    pub fn category(&self) -> RequestCategory {
        RequestCategory::from_path(&self.path)
    }

    /// The path with query and identifier segments stripped, as the abuse
    /// detector counts endpoints.
    pub fn route(&self) -> String {
        route_pattern(&self.path)
    }

    /// The address to locate: the explicit source address, else the client
    /// key itself when it is an address.
    pub fn origin_ip(&self, identity: &ClientIdentity) -> Option<IpAddr> {
        self.source_ip.or_else(|| match identity.kind() {
            IdentityKind::Ip => identity.id().parse().ok(),
            _ => None,
        })
    }
}

/// The engine's answer.
///
/// An admitted analysis request carries a ticket holding its concurrency
/// slot. Hand it back through
/// [`AdmissionEngine::finish_analysis`](super::AdmissionEngine::finish_analysis)
/// or drop it when the analysis is done.
#[derive(Debug)]
pub struct Admission {
    pub decision: Decision,
    pub ticket: Option<AnalysisTicket>,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        self.decision.allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisType;

    #[test]
    fn test_request_from_json_defaults() {
        let json = r#"{"client": "user:7", "path": "/api/search"}"#;
        let request: AdmissionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.category(), RequestCategory::Search);
        assert!(request.analysis.is_none());
        assert!(request.identity().is_authenticated());
    }

    #[test]
    fn test_route_collapses_detail_pages() {
        let first = AdmissionRequest::new("user:7", "GET", "/api/properties/1");
        let second = AdmissionRequest::new("user:7", "GET", "/api/properties/2?tab=photos");
        assert_eq!(first.route(), "/api/properties/:id");
        assert_eq!(first.route(), second.route());
    }

    #[test]
    fn test_origin_ip() {
        let request = AdmissionRequest::new("ip:10.1.2.3", "GET", "/");
        let identity = request.identity();
        assert_eq!(request.origin_ip(&identity), Some("10.1.2.3".parse().unwrap()));

        let request = AdmissionRequest::new("user:1", "GET", "/")
            .with_source_ip("10.9.9.9".parse().unwrap());
        let identity = request.identity();
        assert_eq!(request.origin_ip(&identity), Some("10.9.9.9".parse().unwrap()));

        let request = AdmissionRequest::new("user:1", "GET", "/");
        assert_eq!(request.origin_ip(&request.identity()), None);
    }

    #[test]
    fn test_analysis_request_round_trip() {
        let request = AdmissionRequest::new("api:abc", "POST", "/api/analysis/run")
            .with_analysis(AnalysisRequest::new(AnalysisType::CorrelationAnalysis, 2048, 3));
        let json = serde_json::to_string(&request).unwrap();
        let parsed: AdmissionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }
}
