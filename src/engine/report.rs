//! Status and metrics snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::abuse::{AbuseStats, ClientAbuseStatus};
use crate::analysis::{AnalysisStats, ClientAnalysisStatus};
use crate::geo::GeoStats;
use crate::predictive::{ClientPredictiveStatus, PredictiveStats};
use crate::quota::{ClientQuotaStatus, QuotaStats};

/// Engine-level admission counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub exempt: u64,
    pub denied_by_dimension: BTreeMap<String, u64>,
}

/// Counters from every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub admission: AdmissionStats,
    pub quota: QuotaStats,
    pub abuse: AbuseStats,
    pub analysis: AnalysisStats,
    pub predictive: PredictiveStats,
    pub geo: GeoStats,
}

/// Everything the engine knows about one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatus {
    pub client: String,
    pub tier: String,
    pub quota: ClientQuotaStatus,
    pub abuse: Option<ClientAbuseStatus>,
    pub analysis: ClientAnalysisStatus,
    pub predictive: Option<ClientPredictiveStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub generated_at: DateTime<Utc>,
    pub backend: String,
    /// Live counter keys, when the backend can tell
    pub counter_keys: Option<usize>,
    pub metrics: EngineMetrics,
    pub client: Option<ClientStatus>,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub counter_keys: u64,
    pub quota_clients: usize,
    pub abuse_clients: usize,
    pub analysis_clients: usize,
    pub profiles: usize,
    pub geo_entries: usize,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.counter_keys
            + (self.quota_clients
                + self.abuse_clients
                + self.analysis_clients
                + self.profiles
                + self.geo_entries) as u64
    }
}
