//! End-to-end admission scenarios.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use rampart::analysis::{AnalysisRequest, AnalysisType};
use rampart::clock::ManualClock;
use rampart::decision::Dimension;
use rampart::engine::{AdmissionEngine, AdmissionRequest};
use rampart::error::{RampartError, Result};
use rampart::geo::{GeoLocation, StaticGeoResolver};
use rampart::identity::ClientIdentity;
use rampart::predictive::BehaviorClass;
use rampart::store::{
    Acquisition, Allowance, CounterKey, CounterStore, Counters, MemoryCounterStore,
};
use rampart::RampartConfig;

/// Monday 2024-09-02, 10:00 in Shanghai.
fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 2, 0, 0).unwrap()
}

fn engine_with(config: RampartConfig, resolver: StaticGeoResolver) -> (AdmissionEngine, ManualClock) {
    let clock = ManualClock::new(start());
    let engine = AdmissionEngine::new(
        config,
        Counters::in_memory(),
        Arc::new(resolver),
        Arc::new(clock.clone()),
    );
    (engine, clock)
}

fn engine(yaml: &str) -> (AdmissionEngine, ManualClock) {
    let config = RampartConfig::from_yaml(yaml).unwrap();
    engine_with(config, StaticGeoResolver::new())
}

#[tokio::test]
async fn test_endpoint_limit_denies_51st_request() {
    let (engine, clock) = engine(
        r#"
quota:
  endpoints:
    "GET /api/properties":
      max_requests: 50
      window_secs: 60
"#,
    );
    let request = AdmissionRequest::new("user:alice", "GET", "/api/properties");

    for i in 0..50 {
        let admission = engine.check(&request).await;
        assert!(admission.is_allowed(), "request {} denied: {:?}", i + 1, admission.decision);
        clock.advance(Duration::milliseconds(200));
    }

    let denied = engine.check(&request).await;
    assert!(!denied.is_allowed());
    assert_eq!(denied.decision.dimension, Some(Dimension::Endpoint));
    assert_eq!(denied.decision.retry_after_secs, 50);

    let metrics = engine.export_metrics();
    assert_eq!(metrics.admission.allowed, 50);
    assert_eq!(metrics.admission.denied_by_dimension["endpoint"], 1);
}

#[tokio::test]
async fn test_brute_force_is_throttled_by_abuse_detector() {
    let (engine, clock) = engine(
        r#"
quota:
  categories:
    auth:
      max_requests: 100
      window_secs: 300
"#,
    );
    let request = AdmissionRequest::new("user:mallory", "POST", "/auth/login");

    for i in 0..5 {
        let admission = engine.check(&request).await;
        assert!(admission.is_allowed(), "attempt {} denied", i + 1);
        engine.record_outcome(&request, 401, 20.0);
        clock.advance(Duration::seconds(1));
    }

    let denied = engine.check(&request).await;
    assert_eq!(denied.decision.dimension, Some(Dimension::Abuse));
    assert_eq!(denied.decision.metadata["abuse_type"], "brute_force");
    assert_eq!(denied.decision.metadata["abuse_level"], "high");
    assert_eq!(denied.decision.retry_after_secs, 295);

    let identity = ClientIdentity::user("mallory");
    let incidents = engine.abuse().incidents(&identity);
    assert_eq!(incidents.len(), 3);
    assert!(incidents.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_browsing_detail_pages_is_never_throttled() {
    let (engine, clock) = engine_with(RampartConfig::default(), StaticGeoResolver::new());
    let identity = ClientIdentity::user("bob");

    for id in 1..=30 {
        let request = AdmissionRequest::new(identity.key(), "GET", format!("/api/properties/{}", id));
        let admission = engine.check(&request).await;
        assert!(admission.is_allowed(), "page {} denied: {:?}", id, admission.decision);
        engine.record_outcome(&request, 200, 80.0);
        clock.advance(Duration::seconds(10));
    }

    assert!(engine.abuse().incidents(&identity).is_empty());
    assert_eq!(engine.export_metrics().admission.denied, 0);
}

#[tokio::test]
async fn test_intensive_analysis_holds_single_slot() {
    let (engine, _clock) = engine("{}");
    let identity = ClientIdentity::api("acme");
    let request = AdmissionRequest::new(identity.key(), "POST", "/api/analysis/correlation")
        .with_analysis(AnalysisRequest::new(
            AnalysisType::CorrelationAnalysis,
            150 * 1024,
            2,
        ));

    let first = engine.check(&request).await;
    assert!(first.is_allowed());
    let ticket = first.ticket.expect("admitted analysis carries a ticket");
    assert_eq!(
        engine.status(Some(&identity)).client.unwrap().analysis.in_flight["intensive"],
        1
    );

    let second = engine.check(&request).await;
    assert_eq!(second.decision.dimension, Some(Dimension::Concurrency));
    assert!(second.ticket.is_none());
    assert!(engine.analysis().recently_throttled(&identity));

    drop(ticket);
    let third = engine.check(&request).await;
    assert!(third.is_allowed());
    assert!(third.ticket.is_some());
}

#[tokio::test]
async fn test_vpn_traffic_always_denied() {
    let resolver = StaticGeoResolver::new()
        .with_range(
            "10.0.0.0/24".parse().unwrap(),
            GeoLocation::new("CN", "Hebei", chrono_tz::Asia::Shanghai),
        )
        .with_range(
            "10.0.0.66/32".parse().unwrap(),
            GeoLocation::new("CN", "Hebei", chrono_tz::Asia::Shanghai).with_vpn(true),
        );
    let (engine, clock) = engine_with(RampartConfig::default(), resolver);

    for _ in 0..5 {
        let request = AdmissionRequest::new("user:v", "GET", "/listings")
            .with_source_ip("10.0.0.66".parse().unwrap());
        let admission = engine.check(&request).await;
        assert_eq!(admission.decision.dimension, Some(Dimension::GeoBlock));
        assert_eq!(admission.decision.retry_after_secs, 86_400);
        clock.advance(Duration::seconds(3));
    }

    let domestic = AdmissionRequest::new("ip:10.0.0.5", "GET", "/listings");
    let admission = engine.check(&domestic).await;
    assert!(admission.is_allowed());
    assert_eq!(admission.decision.metadata["province"], "Hebei");
}

#[tokio::test]
async fn test_profile_survives_export_and_import() {
    let (source, clock) = engine("{}");
    let identity = ClientIdentity::user("mover");
    let request = AdmissionRequest::new(identity.key(), "GET", "/api/search");
    for gap in [0.2, 0.6, 0.2, 0.6, 0.2, 0.6] {
        source.check(&request).await;
        clock.advance_secs_f64(gap);
    }

    let snapshot = source.predictive().export_profile(&identity).unwrap();
    let json = serde_json::to_string(&snapshot).unwrap();

    let (target, _clock) = engine("{}");
    target
        .predictive()
        .import_profile(serde_json::from_str(&json).unwrap())
        .unwrap();

    let before = source.predictive().client_status(&identity).unwrap();
    let after = target.predictive().client_status(&identity).unwrap();
    assert_eq!(after.behavior, BehaviorClass::Suspicious);
    assert_eq!(after.behavior, before.behavior);
    assert_eq!(after.trust_score, before.trust_score);
}

#[tokio::test]
async fn test_clear_client_resets_limits() {
    let (engine, _clock) = engine(
        r#"
quota:
  endpoints:
    "GET /api/properties":
      max_requests: 3
      window_secs: 60
"#,
    );
    let identity = ClientIdentity::user("reset");
    let request = AdmissionRequest::new(identity.key(), "GET", "/api/properties");

    for _ in 0..3 {
        assert!(engine.check(&request).await.is_allowed());
    }
    assert!(!engine.check(&request).await.is_allowed());
    assert_eq!(engine.quota().client_status(&identity).violations, 1);

    assert!(engine.clear_client(&identity).await);
    assert_eq!(engine.quota().client_status(&identity).violations, 0);
    assert!(engine.check(&request).await.is_allowed());
}

#[tokio::test]
async fn test_cleanup_evicts_idle_state() {
    let (engine, clock) = engine("{}");
    for id in ["a", "b", "c"] {
        let request = AdmissionRequest::new(format!("user:{}", id), "GET", "/api/search");
        engine.check(&request).await;
        engine.record_outcome(&request, 200, 12.0);
    }
    assert_eq!(engine.export_metrics().predictive.profiles, 3);

    clock.advance(Duration::hours(2));
    let report = engine.cleanup(Duration::hours(1)).await;
    assert_eq!(report.profiles, 3);
    assert_eq!(report.abuse_clients, 3);
    assert!(report.counter_keys > 0);
    assert_eq!(engine.export_metrics().predictive.profiles, 0);
}

#[tokio::test]
async fn test_maintenance_stops_with_engine() {
    let mut config = RampartConfig::default();
    config.maintenance.sweep_interval_secs = 1;
    let (engine, _clock) = engine_with(config, StaticGeoResolver::new());
    let engine = Arc::new(engine);

    let handle = engine.spawn_maintenance();
    drop(engine);

    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("maintenance task should stop once the engine is gone")
        .unwrap();
}

/// A backend that is always unreachable.
struct UnreachableStore;

#[async_trait]
impl CounterStore for UnreachableStore {
    async fn acquire(&self, _allowances: &[Allowance], _now: DateTime<Utc>) -> Result<Acquisition> {
        Err(RampartError::BackendUnavailable("connection refused".into()))
    }

    async fn record(&self, _key: &CounterKey, _at: DateTime<Utc>) -> Result<()> {
        Err(RampartError::BackendUnavailable("connection refused".into()))
    }

    async fn count(&self, _key: &CounterKey, _window: Duration, _now: DateTime<Utc>) -> Result<u64> {
        Err(RampartError::BackendUnavailable("connection refused".into()))
    }

    async fn oldest(
        &self,
        _key: &CounterKey,
        _window: Duration,
        _now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        Err(RampartError::BackendUnavailable("connection refused".into()))
    }

    async fn remove_identity(&self, _identity: &str) -> Result<u64> {
        Err(RampartError::BackendUnavailable("connection refused".into()))
    }

    async fn sweep(&self, _now: DateTime<Utc>) -> Result<u64> {
        Err(RampartError::BackendUnavailable("connection refused".into()))
    }

    fn key_count(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

#[tokio::test]
async fn test_unreachable_backend_fails_open() {
    let mut config = RampartConfig::default();
    config.predictive.enabled = false;
    let clock = ManualClock::new(start());
    let engine = AdmissionEngine::new(
        config,
        Counters::new(Arc::new(UnreachableStore)),
        Arc::new(StaticGeoResolver::new()),
        Arc::new(clock.clone()),
    );

    let request = AdmissionRequest::new("ip:192.0.2.1", "GET", "/api/properties");
    for _ in 0..200 {
        assert!(engine.check(&request).await.is_allowed());
        clock.advance(Duration::milliseconds(100));
    }
    assert_eq!(engine.status(None).backend, "unreachable");
}

/// A memory store behind a network-like delay on every call.
struct SlowStore {
    inner: MemoryCounterStore,
    delay: std::time::Duration,
}

impl SlowStore {
    fn new() -> Self {
        Self {
            inner: MemoryCounterStore::new(),
            delay: std::time::Duration::from_millis(2),
        }
    }
}

#[async_trait]
impl CounterStore for SlowStore {
    async fn acquire(&self, allowances: &[Allowance], now: DateTime<Utc>) -> Result<Acquisition> {
        tokio::time::sleep(self.delay).await;
        self.inner.acquire(allowances, now).await
    }

    async fn record(&self, key: &CounterKey, at: DateTime<Utc>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.record(key, at).await
    }

    async fn count(&self, key: &CounterKey, window: Duration, now: DateTime<Utc>) -> Result<u64> {
        tokio::time::sleep(self.delay).await;
        self.inner.count(key, window, now).await
    }

    async fn oldest(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.oldest(key, window, now).await
    }

    async fn remove_identity(&self, identity: &str) -> Result<u64> {
        self.inner.remove_identity(identity).await
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.sweep(now).await
    }

    fn key_count(&self) -> Option<usize> {
        self.inner.key_count()
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_respect_endpoint_limit() {
    let mut config = RampartConfig::from_yaml(
        r#"
quota:
  endpoints:
    "GET /api/properties":
      max_requests: 5
      window_secs: 60
"#,
    )
    .unwrap();
    config.predictive.enabled = false;
    let engine = Arc::new(AdmissionEngine::new(
        config,
        Counters::new(Arc::new(SlowStore::new())),
        Arc::new(StaticGeoResolver::new()),
        Arc::new(ManualClock::new(start())),
    ));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let request = AdmissionRequest::new("user:rush", "GET", "/api/properties");
                engine.check(&request).await.decision
            })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        let decision = handle.await.unwrap();
        if decision.allowed {
            allowed += 1;
        } else {
            assert_eq!(decision.dimension, Some(Dimension::Endpoint));
        }
    }
    assert_eq!(allowed, 5);
}
