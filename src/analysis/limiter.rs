//! Complexity-aware limits for analysis requests.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::rules::AnalysisConfig;
use super::types::{AnalysisOutcome, AnalysisRequest, AnalysisType, Complexity};
use crate::clock::Clock;
use crate::config::LimitRule;
use crate::decision::{retry_after, Decision, Dimension};
use crate::identity::ClientIdentity;
use crate::store::{CounterKey, Counters};

type SlotKey = (String, Complexity);

/// An admitted analysis holding one in-flight slot.
///
/// The slot is released when the ticket is passed to
/// [`AnalysisLimiter::finish`] or dropped.
#[derive(Debug)]
pub struct AnalysisTicket {
    client: String,
    analysis_type: AnalysisType,
    complexity: Complexity,
    started: DateTime<Utc>,
    slots: Arc<DashMap<SlotKey, usize>>,
}

impl AnalysisTicket {
    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn analysis_type(&self) -> AnalysisType {
        self.analysis_type
    }

    pub fn complexity(&self) -> Complexity {
        self.complexity
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }
}

impl Drop for AnalysisTicket {
    fn drop(&mut self) {
        let key = (std::mem::take(&mut self.client), self.complexity);
        if let Some(mut slot) = self.slots.get_mut(&key) {
            *slot = slot.saturating_sub(1);
        }
        self.slots.remove_if(&key, |_, in_flight| *in_flight == 0);
    }
}

#[derive(Debug, Default)]
struct TypeCounters {
    admitted: u64,
    denied: u64,
    succeeded: u64,
    failed: u64,
    cache_hits: u64,
    total_processing_ms: f64,
}

/// Observability view of one analysis type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTypeStats {
    pub admitted: u64,
    pub denied: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_processing_ms: f64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub admitted: u64,
    pub denied: u64,
    pub in_flight: usize,
    pub by_type: BTreeMap<String, AnalysisTypeStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAnalysisStatus {
    pub in_flight: BTreeMap<String, usize>,
    pub recently_throttled: bool,
    pub last_denied: Option<DateTime<Utc>>,
}

/// Limits analysis requests by complexity, type, payload size and tier.
pub struct AnalysisLimiter {
    config: AnalysisConfig,
    counters: Counters,
    clock: Arc<dyn Clock>,
    slots: Arc<DashMap<SlotKey, usize>>,
    last_denied: DashMap<String, DateTime<Utc>>,
    by_type: Mutex<BTreeMap<AnalysisType, TypeCounters>>,
    admitted: AtomicU64,
    denied: AtomicU64,
}

impl AnalysisLimiter {
    pub fn new(config: AnalysisConfig, counters: Counters, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            counters,
            clock,
            slots: Arc::new(DashMap::new()),
            last_denied: DashMap::new(),
            by_type: Mutex::new(BTreeMap::new()),
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Check an analysis request.
    ///
    /// On admission the returned ticket holds the in-flight slot until the
    /// analysis finishes.
    pub async fn check(
        &self,
        identity: &ClientIdentity,
        request: &AnalysisRequest,
    ) -> (Decision, Option<AnalysisTicket>) {
        let now = self.clock.now();
        let client = identity.key();
        let complexity = request.complexity();
        let bucket = request.payload_bucket();
        let tier = identity.tier();
        let complexity_rule = self.config.complexity.get(complexity);

        trace!(
            client = %identity,
            analysis_type = request.analysis_type.as_str(),
            complexity = complexity.as_str(),
            payload = bucket.as_str(),
            "Checking analysis request"
        );

        let reserved = self.reserve(
            &client,
            request.analysis_type,
            complexity,
            complexity_rule.max_concurrent,
            now,
        );
        let Some(ticket) = reserved else {
            let retry = self.expected_duration_secs(request.analysis_type);
            debug!(
                client = %identity,
                complexity = complexity.as_str(),
                max_concurrent = complexity_rule.max_concurrent,
                "Analysis concurrency cap reached"
            );
            self.note_denial(&client, request.analysis_type, now);
            return (
                Decision::deny(Dimension::Concurrency, retry)
                    .with("complexity", complexity.as_str())
                    .with("max_concurrent", complexity_rule.max_concurrent as u64),
                None,
            );
        };

        let axes = [
            (
                Dimension::Complexity,
                format!("analysis:complexity:{}", complexity.as_str()),
                complexity_rule.limit,
            ),
            (
                Dimension::AnalysisType,
                format!("analysis:type:{}", request.analysis_type.as_str()),
                self.config.types.get(request.analysis_type),
            ),
            (
                Dimension::PayloadSize,
                format!("analysis:payload:{}", bucket.as_str()),
                self.config.payload.get(bucket),
            ),
            (
                Dimension::Tier,
                format!("analysis:tier:{}", tier.as_str()),
                self.config.tiers.get(tier),
            ),
        ];

        let mut keys = Vec::with_capacity(axes.len());
        for (dimension, name, rule) in axes {
            let key = CounterKey::new(name, client.as_str(), rule.window());
            if let Some(decision) = self.check_axis(&key, dimension, rule, now).await {
                drop(ticket);
                debug!(client = %identity, dimension = ?dimension, "Analysis limit exceeded");
                self.note_denial(&client, request.analysis_type, now);
                return (decision.with("complexity", complexity.as_str()), None);
            }
            keys.push(key);
        }

        self.counters.record_all(&keys, now).await;
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.by_type
            .lock()
            .entry(request.analysis_type)
            .or_default()
            .admitted += 1;

        let decision = Decision::allow()
            .with("complexity", complexity.as_str())
            .with("payload_bucket", bucket.as_str())
            .with("tier", tier.as_str());
        (decision, Some(ticket))
    }

    async fn check_axis(
        &self,
        key: &CounterKey,
        dimension: Dimension,
        rule: LimitRule,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        let window = rule.window();
        let count = self.counters.count(key, window, now).await;
        if count < rule.max_requests {
            return None;
        }
        let oldest = self.counters.oldest(key, window, now).await;
        Some(
            Decision::deny(dimension, retry_after(window, oldest, now))
                .with("limit", rule.max_requests)
                .with("current", count),
        )
    }

    fn reserve(
        &self,
        client: &str,
        analysis_type: AnalysisType,
        complexity: Complexity,
        max_concurrent: usize,
        now: DateTime<Utc>,
    ) -> Option<AnalysisTicket> {
        {
            let mut in_flight = self
                .slots
                .entry((client.to_string(), complexity))
                .or_insert(0);
            if *in_flight >= max_concurrent {
                return None;
            }
            *in_flight += 1;
        }
        Some(AnalysisTicket {
            client: client.to_string(),
            analysis_type,
            complexity,
            started: now,
            slots: Arc::clone(&self.slots),
        })
    }

    fn note_denial(&self, client: &str, analysis_type: AnalysisType, now: DateTime<Utc>) {
        self.denied.fetch_add(1, Ordering::Relaxed);
        self.last_denied.insert(client.to_string(), now);
        self.by_type.lock().entry(analysis_type).or_default().denied += 1;
    }

    /// Average processing time of a type in whole seconds, at least one.
    fn expected_duration_secs(&self, analysis_type: AnalysisType) -> u64 {
        let by_type = self.by_type.lock();
        match by_type.get(&analysis_type) {
            Some(c) if c.succeeded + c.failed > 0 => {
                let avg_ms = c.total_processing_ms / (c.succeeded + c.failed) as f64;
                ((avg_ms / 1000.0).ceil() as u64).max(1)
            }
            _ => 1,
        }
    }

    /// Record how an admitted analysis went and release its slot.
    pub fn finish(&self, ticket: AnalysisTicket, outcome: AnalysisOutcome) {
        let elapsed = self.clock.now() - ticket.started;
        let elapsed_ms = elapsed.num_milliseconds().max(0) as f64;

        {
            let mut by_type = self.by_type.lock();
            let counters = by_type.entry(ticket.analysis_type).or_default();
            if outcome.success {
                counters.succeeded += 1;
            } else {
                counters.failed += 1;
            }
            if outcome.cache_hit {
                counters.cache_hits += 1;
            }
            counters.total_processing_ms += elapsed_ms;
        }

        trace!(
            client = %ticket.client,
            analysis_type = ticket.analysis_type.as_str(),
            elapsed_ms = elapsed_ms,
            success = outcome.success,
            "Analysis finished"
        );
    }

    /// Whether the client was denied within the throttle memory.
    pub fn recently_throttled(&self, identity: &ClientIdentity) -> bool {
        let cutoff = self.clock.now() - self.config.throttle_memory();
        self.last_denied
            .get(&identity.key())
            .map(|at| *at > cutoff)
            .unwrap_or(false)
    }

    pub fn client_status(&self, identity: &ClientIdentity) -> ClientAnalysisStatus {
        let client = identity.key();
        let in_flight = self
            .slots
            .iter()
            .filter(|entry| entry.key().0 == client)
            .map(|entry| (entry.key().1.as_str().to_string(), *entry.value()))
            .collect();
        ClientAnalysisStatus {
            in_flight,
            recently_throttled: self.recently_throttled(identity),
            last_denied: self.last_denied.get(&client).map(|at| *at),
        }
    }

    /// Forget a client's denial history. In-flight slots stay with their
    /// tickets.
    pub fn clear_client(&self, identity: &ClientIdentity) -> bool {
        self.last_denied.remove(&identity.key()).is_some()
    }

    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = self.clock.now() - max_age;
        let before = self.last_denied.len();
        self.last_denied.retain(|_, at| *at > cutoff);
        before - self.last_denied.len()
    }

    pub fn stats(&self) -> AnalysisStats {
        let by_type = self
            .by_type
            .lock()
            .iter()
            .map(|(analysis_type, c)| {
                let finished = c.succeeded + c.failed;
                let stats = AnalysisTypeStats {
                    admitted: c.admitted,
                    denied: c.denied,
                    succeeded: c.succeeded,
                    failed: c.failed,
                    avg_processing_ms: if finished > 0 {
                        c.total_processing_ms / finished as f64
                    } else {
                        0.0
                    },
                    cache_hit_rate: if finished > 0 {
                        c.cache_hits as f64 / finished as f64
                    } else {
                        0.0
                    },
                };
                (analysis_type.as_str().to_string(), stats)
            })
            .collect();

        AnalysisStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            in_flight: self.slots.iter().map(|entry| *entry.value()).sum(),
            by_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn setup(config: AnalysisConfig) -> (AnalysisLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 2, 14, 0, 0).unwrap());
        let limiter = AnalysisLimiter::new(config, Counters::in_memory(), Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn client() -> ClientIdentity {
        ClientIdentity::user("analyst")
    }

    #[tokio::test]
    async fn test_concurrency_cap_without_consuming_budget() {
        let (limiter, _clock) = setup(AnalysisConfig::default());
        let request = AnalysisRequest::new(AnalysisType::CorrelationAnalysis, 150 * 1024, 0);

        let (first, ticket) = limiter.check(&client(), &request).await;
        assert!(first.allowed);
        assert_eq!(first.metadata["complexity"], "intensive");
        let ticket = ticket.unwrap();

        let (second, none) = limiter.check(&client(), &request).await;
        assert!(!second.allowed);
        assert_eq!(second.dimension, Some(Dimension::Concurrency));
        assert!(none.is_none());
        assert!(limiter.recently_throttled(&client()));

        limiter.finish(ticket, AnalysisOutcome::success());
        assert_eq!(limiter.stats().in_flight, 0);

        // Only the first admission consumed the intensive budget of 3.
        for _ in 0..2 {
            let (decision, ticket) = limiter.check(&client(), &request).await;
            assert!(decision.allowed);
            drop(ticket);
        }
        let (decision, _) = limiter.check(&client(), &request).await;
        assert_eq!(decision.dimension, Some(Dimension::Complexity));
    }

    #[tokio::test]
    async fn test_dropped_ticket_releases_slot() {
        let (limiter, _clock) = setup(AnalysisConfig::default());
        let request = AnalysisRequest::new(AnalysisType::ClusteringAnalysis, 0, 0);

        let (_, ticket) = limiter.check(&client(), &request).await;
        assert_eq!(limiter.client_status(&client()).in_flight["intensive"], 1);
        drop(ticket);
        assert!(limiter.client_status(&client()).in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_type_limit() {
        let mut config = AnalysisConfig::default();
        config.types.price_trend = LimitRule::new(2, 60);
        let (limiter, _clock) = setup(config);
        let request = AnalysisRequest::new(AnalysisType::PriceTrend, 200, 1);

        for _ in 0..2 {
            assert!(limiter.check(&client(), &request).await.0.allowed);
        }
        let (decision, _) = limiter.check(&client(), &request).await;
        assert_eq!(decision.dimension, Some(Dimension::AnalysisType));
        assert_eq!(decision.retry_after_secs, 60);
    }

    #[tokio::test]
    async fn test_massive_payload_limit() {
        let (limiter, clock) = setup(AnalysisConfig::default());
        let request = AnalysisRequest::new(AnalysisType::PriceTrend, 2 * 1024 * 1024, 0);

        let (decision, ticket) = limiter.check(&client(), &request).await;
        assert!(decision.allowed);
        clock.advance(Duration::seconds(4));
        limiter.finish(ticket.unwrap(), AnalysisOutcome::cached());

        let (decision, _) = limiter.check(&client(), &request).await;
        assert_eq!(decision.dimension, Some(Dimension::PayloadSize));
        assert_eq!(decision.retry_after_secs, 296);

        let stats = limiter.stats();
        let price = &stats.by_type["price_trend"];
        assert_eq!(price.admitted, 1);
        assert_eq!(price.denied, 1);
        assert_eq!(price.avg_processing_ms, 4000.0);
        assert_eq!(price.cache_hit_rate, 1.0);
    }

    #[tokio::test]
    async fn test_tier_limit_by_identity() {
        let mut config = AnalysisConfig::default();
        config.tiers.default = LimitRule::new(1, 3600);
        let (limiter, _clock) = setup(config);
        let request = AnalysisRequest::new(AnalysisType::PriceTrend, 0, 0);

        assert!(limiter.check(&client(), &request).await.0.allowed);
        let (decision, _) = limiter.check(&client(), &request).await;
        assert_eq!(decision.dimension, Some(Dimension::Tier));

        let premium = ClientIdentity::api("partner");
        assert!(limiter.check(&premium, &request).await.0.allowed);
        assert!(limiter.check(&premium, &request).await.0.allowed);
    }

    #[tokio::test]
    async fn test_throttle_memory_expires() {
        let mut config = AnalysisConfig::default();
        config.types.price_trend = LimitRule::new(1, 60);
        let (limiter, clock) = setup(config);
        let request = AnalysisRequest::new(AnalysisType::PriceTrend, 0, 0);

        limiter.check(&client(), &request).await;
        limiter.check(&client(), &request).await;
        assert!(limiter.recently_throttled(&client()));

        clock.advance(Duration::seconds(61));
        assert!(!limiter.recently_throttled(&client()));
        assert_eq!(limiter.cleanup(Duration::seconds(60)), 1);
    }
}
