//! The admission engine.
//!
//! [`AdmissionEngine`] owns one of each limiter and runs them in a fixed
//! order for every request:
//!
//! 1. exempt paths (health checks, static assets) are admitted outright
//! 2. quota
//! 3. abuse, at reduced fidelity while the client is being throttled by the
//!    analysis limiter
//! 4. analysis, for requests that carry an analysis payload
//! 5. predictive, when enabled
//! 6. geographic, when enabled and the source address is known
//!
//! The first denial wins. Build one engine and share it behind an `Arc`.

mod report;
mod request;

pub use self::report::{
    AdmissionStats, CleanupReport, ClientStatus, EngineMetrics, EngineStatus,
};
pub use self::request::{Admission, AdmissionRequest};

use chrono::Duration;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::abuse::{AbuseDetector, MetricFidelity, RequestEvent};
use crate::analysis::{AnalysisLimiter, AnalysisOutcome, AnalysisTicket};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, RampartConfig};
use crate::decision::Decision;
use crate::error::Result;
use crate::geo::{GeoLimiter, GeoResolver, StaticGeoResolver};
use crate::identity::ClientIdentity;
use crate::predictive::PredictiveLimiter;
use crate::quota::QuotaLimiter;
use crate::store::{Counters, RedisCounterStore};

/// Multi-dimensional admission control.
pub struct AdmissionEngine {
    config: RampartConfig,
    counters: Counters,
    clock: Arc<dyn Clock>,
    quota: QuotaLimiter,
    abuse: AbuseDetector,
    analysis: AnalysisLimiter,
    predictive: PredictiveLimiter,
    geo: GeoLimiter,
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    exempt: AtomicU64,
    denied_by_dimension: Mutex<BTreeMap<&'static str, u64>>,
}

impl AdmissionEngine {
    pub fn new(
        config: RampartConfig,
        counters: Counters,
        resolver: Arc<dyn GeoResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            quota: QuotaLimiter::new(config.quota.clone(), counters.clone(), clock.clone()),
            abuse: AbuseDetector::new(config.abuse.clone(), counters.clone(), clock.clone()),
            analysis: AnalysisLimiter::new(config.analysis.clone(), counters.clone(), clock.clone()),
            predictive: PredictiveLimiter::new(
                config.predictive.clone(),
                counters.clone(),
                clock.clone(),
            ),
            geo: GeoLimiter::new(config.geo.clone(), counters.clone(), resolver, clock.clone()),
            config,
            counters,
            clock,
            checks: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            exempt: AtomicU64::new(0),
            denied_by_dimension: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build an engine from configuration with the system clock and the
    /// static resolver from `geo.static_locations`.
    ///
    /// An unreachable Redis backend is not fatal: the engine falls back to
    /// in-memory counters.
    pub async fn from_config(config: RampartConfig) -> Result<Self> {
        config.validate()?;

        let counters = match config.backend.kind {
            BackendKind::Memory => Counters::in_memory(),
            BackendKind::Redis => {
                match RedisCounterStore::connect(config.backend.redis.clone()).await {
                    Ok(store) => Counters::new(Arc::new(store)),
                    Err(e) => {
                        warn!(error = %e, "Redis unavailable, falling back to in-memory counters");
                        Counters::in_memory()
                    }
                }
            }
        };

        let resolver = Arc::new(StaticGeoResolver::from_entries(
            config.geo.static_locations.clone(),
            config.geo.default_location.clone(),
        ));

        info!(
            backend = counters.store().name(),
            predictive = config.predictive.enabled,
            geo = config.geo.enabled,
            "Admission engine initialized"
        );

        Ok(Self::new(config, counters, resolver, Arc::new(SystemClock::new())))
    }

    pub fn config(&self) -> &RampartConfig {
        &self.config
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn quota(&self) -> &QuotaLimiter {
        &self.quota
    }

    pub fn abuse(&self) -> &AbuseDetector {
        &self.abuse
    }

    pub fn analysis(&self) -> &AnalysisLimiter {
        &self.analysis
    }

    pub fn predictive(&self) -> &PredictiveLimiter {
        &self.predictive
    }

    pub fn geo(&self) -> &GeoLimiter {
        &self.geo
    }

    /// Decide whether to admit a request.
    pub async fn check(&self, request: &AdmissionRequest) -> Admission {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let identity = request.identity();

        if self.quota.config().is_exempt(&request.path) {
            self.exempt.fetch_add(1, Ordering::Relaxed);
            trace!(client = %identity, path = %request.path, "Exempt path");
            return self.admit(Decision::allow().with("exempt", true), None);
        }

        let mut admitted = Decision::allow();

        let decision = self
            .quota
            .check(&identity, &request.method, &request.path)
            .await;
        if !decision.allowed {
            return self.reject(&identity, decision, admitted);
        }
        admitted.absorb(decision.metadata);

        let fidelity = if self.analysis.recently_throttled(&identity) {
            MetricFidelity::Cached
        } else {
            MetricFidelity::Full
        };
        let decision = self.abuse.check(&identity, fidelity).await;
        if !decision.allowed {
            return self.reject(&identity, decision, admitted);
        }
        admitted.absorb(decision.metadata);

        let mut ticket = None;
        if let Some(analysis) = &request.analysis {
            let (decision, admitted_ticket) = self.analysis.check(&identity, analysis).await;
            if !decision.allowed {
                return self.reject(&identity, decision, admitted);
            }
            admitted.absorb(decision.metadata);
            ticket = admitted_ticket;
        }

        if self.predictive.is_enabled() {
            let decision = self.predictive.check(&identity, request.category()).await;
            if !decision.allowed {
                // Dropping the ticket gives the analysis slot back.
                drop(ticket);
                return self.reject(&identity, decision, admitted);
            }
            admitted.absorb(decision.metadata);
        }

        if self.geo.is_enabled() {
            if let Some(ip) = request.origin_ip(&identity) {
                let decision = self.geo.check(&identity, ip).await;
                if !decision.allowed {
                    drop(ticket);
                    return self.reject(&identity, decision, admitted);
                }
                admitted.absorb(decision.metadata);
            }
        }

        trace!(client = %identity, path = %request.path, "Admitted");
        self.admit(admitted, ticket)
    }

    fn admit(&self, decision: Decision, ticket: Option<AnalysisTicket>) -> Admission {
        self.allowed.fetch_add(1, Ordering::Relaxed);
        Admission { decision, ticket }
    }

    fn reject(&self, identity: &ClientIdentity, mut decision: Decision, earlier: Decision) -> Admission {
        decision.absorb(earlier.metadata);
        self.denied.fetch_add(1, Ordering::Relaxed);
        if let Some(dimension) = decision.dimension {
            *self
                .denied_by_dimension
                .lock()
                .entry(dimension.as_str())
                .or_insert(0) += 1;
        }

        debug!(
            client = %identity,
            dimension = ?decision.dimension,
            retry_after = decision.retry_after_secs,
            "Request denied"
        );

        Admission {
            decision,
            ticket: None,
        }
    }

    /// Feed a completed request to the abuse detector.
    pub fn record_outcome(&self, request: &AdmissionRequest, status_code: u16, response_time_ms: f64) {
        let identity = request.identity();
        let mut event = RequestEvent::new(
            self.clock.now(),
            request.method.clone(),
            request.route(),
            status_code,
        )
        .with_response_time_ms(response_time_ms);
        event.parameters = request.parameters.clone();
        event.user_agent = request.user_agent.clone();
        event.source_ip = request.origin_ip(&identity);

        self.abuse.record_event(&identity, event);
    }

    /// Report how an admitted analysis went and release its slot.
    pub fn finish_analysis(&self, ticket: AnalysisTicket, outcome: AnalysisOutcome) {
        self.analysis.finish(ticket, outcome);
    }

    /// Engine metrics and, if asked for, one client's state.
    pub fn status(&self, client: Option<&ClientIdentity>) -> EngineStatus {
        let store = self.counters.store();
        EngineStatus {
            generated_at: self.clock.now(),
            backend: store.name().to_string(),
            counter_keys: store.key_count(),
            metrics: self.export_metrics(),
            client: client.map(|identity| ClientStatus {
                client: identity.key(),
                tier: identity.tier().as_str().to_string(),
                quota: self.quota.client_status(identity),
                abuse: self.abuse.client_status(identity),
                analysis: self.analysis.client_status(identity),
                predictive: self.predictive.client_status(identity),
            }),
        }
    }

    pub fn export_metrics(&self) -> EngineMetrics {
        EngineMetrics {
            admission: AdmissionStats {
                checks: self.checks.load(Ordering::Relaxed),
                allowed: self.allowed.load(Ordering::Relaxed),
                denied: self.denied.load(Ordering::Relaxed),
                exempt: self.exempt.load(Ordering::Relaxed),
                denied_by_dimension: self
                    .denied_by_dimension
                    .lock()
                    .iter()
                    .map(|(dimension, n)| (dimension.to_string(), *n))
                    .collect(),
            },
            quota: self.quota.stats(),
            abuse: self.abuse.stats(),
            analysis: self.analysis.stats(),
            predictive: self.predictive.stats(),
            geo: self.geo.stats(),
        }
    }

    /// Forget everything about a client, counters included. Returns whether
    /// any state existed.
    pub async fn clear_client(&self, identity: &ClientIdentity) -> bool {
        let mut cleared = self.quota.clear_client(identity);
        cleared |= self.abuse.clear_client(identity);
        cleared |= self.analysis.clear_client(identity);
        cleared |= self.predictive.clear_client(identity);
        let keys = self.counters.remove_identity(&identity.key()).await;

        info!(client = %identity, counter_keys = keys, "Cleared client state");
        cleared || keys > 0
    }

    /// Sweep expired counters and evict state idle for longer than `max_age`.
    pub async fn cleanup(&self, max_age: Duration) -> CleanupReport {
        let report = CleanupReport {
            counter_keys: self.counters.sweep(self.clock.now()).await,
            quota_clients: self.quota.cleanup(max_age),
            abuse_clients: self.abuse.cleanup(max_age),
            analysis_clients: self.analysis.cleanup(max_age),
            profiles: self.predictive.cleanup(max_age),
            geo_entries: self.geo.cleanup(max_age),
        };
        if report.total() > 0 {
            debug!(removed = report.total(), report = ?report, "Cleanup finished");
        }
        report
    }

    /// Run [`cleanup`](Self::cleanup) every `maintenance.sweep_interval_secs`
    /// until the engine is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.maintenance.sweep_interval();
        let max_idle = self.config.maintenance.max_idle();

        info!(interval_secs = period.as_secs(), "Starting maintenance task");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Engine dropped, stopping maintenance");
                    break;
                };
                engine.cleanup(max_idle).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::decision::Dimension;
    use chrono::{TimeZone, Utc};

    fn engine() -> (AdmissionEngine, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 2, 2, 0, 0).unwrap());
        let engine = AdmissionEngine::new(
            RampartConfig::default(),
            Counters::in_memory(),
            Arc::new(StaticGeoResolver::new()),
            Arc::new(clock.clone()),
        );
        (engine, clock)
    }

    #[tokio::test]
    async fn test_exempt_path_skips_everything() {
        let (engine, _clock) = engine();
        let request = AdmissionRequest::new("ip:10.0.0.1", "GET", "/health");
        for _ in 0..500 {
            assert!(engine.check(&request).await.is_allowed());
        }
        let metrics = engine.export_metrics();
        assert_eq!(metrics.admission.exempt, 500);
        assert_eq!(metrics.quota.checks, 0);
    }

    #[tokio::test]
    async fn test_metadata_merged_on_admission() {
        let (engine, _clock) = engine();
        let admission = engine
            .check(&AdmissionRequest::new("user:9", "GET", "/api/properties"))
            .await;
        assert!(admission.is_allowed());
        assert_eq!(admission.decision.metadata["category"], "api");
        assert!(admission.decision.metadata.contains_key("behavior"));
        assert!(admission.ticket.is_none());
    }

    #[tokio::test]
    async fn test_denials_counted_by_dimension() {
        let (engine, _clock) = engine();
        let request = AdmissionRequest::new("user:1", "POST", "/auth/login");
        let mut last = None;
        for _ in 0..6 {
            last = Some(engine.check(&request).await);
        }
        let last = last.unwrap();
        assert_eq!(last.decision.dimension, Some(Dimension::Category));

        let metrics = engine.export_metrics();
        assert_eq!(metrics.admission.denied, 1);
        assert_eq!(metrics.admission.denied_by_dimension["category"], 1);
    }

    #[tokio::test]
    async fn test_status_for_client() {
        let (engine, _clock) = engine();
        let identity = ClientIdentity::api("system-batch");
        let request = AdmissionRequest::new(identity.key(), "GET", "/api/search");
        engine.check(&request).await;

        let status = engine.status(Some(&identity));
        assert_eq!(status.backend, "memory");
        let client = status.client.unwrap();
        assert_eq!(client.tier, "system");
        assert!(client.predictive.is_some());
    }
}
