//! Admission from forecast client load.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::models::{predict, ModelInput, Prediction};
use super::profile::{BehaviorClass, ClientBehaviorProfile, ProfileSnapshot};
use super::rules::PredictiveConfig;
use crate::clock::Clock;
use crate::decision::{Decision, Dimension, RequestCategory};
use crate::error::Result;
use crate::identity::ClientIdentity;
use crate::store::{CounterKey, Counters};

/// Identity of the shared per-category counter.
const CATEGORY_IDENTITY: &str = "global";

/// Outcome of the synchronous part of an evaluation.
struct Evaluation {
    behavior: BehaviorClass,
    trust: f64,
    prediction: Prediction,
    dynamic_limit: f64,
    threshold: f64,
    mean_interval: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPredictiveStatus {
    pub behavior: BehaviorClass,
    pub trust_score: f64,
    pub requests_tracked: usize,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictiveStats {
    pub checks: u64,
    pub denied: u64,
    pub model_fallbacks: u64,
    pub profiles: usize,
    pub evicted: u64,
}

/// Limits clients on their predicted near-future load.
pub struct PredictiveLimiter {
    config: PredictiveConfig,
    counters: Counters,
    clock: Arc<dyn Clock>,
    profiles: DashMap<String, Arc<Mutex<ClientBehaviorProfile>>>,
    checks: AtomicU64,
    denied: AtomicU64,
    fallbacks: AtomicU64,
    evicted: AtomicU64,
}

impl PredictiveLimiter {
    pub fn new(config: PredictiveConfig, counters: Counters, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            counters,
            clock,
            profiles: DashMap::new(),
            checks: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check a request against the client's forecast load for its category.
    pub async fn check(&self, identity: &ClientIdentity, category: RequestCategory) -> Decision {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let client = identity.key();
        let rule = self.config.rule_for(category);
        let window = rule.window();
        let category_window = self.config.category_window();

        let client_key = CounterKey::new(
            format!("predictive:{}", category.as_str()),
            client.as_str(),
            window,
        );
        let category_key = CounterKey::new(
            format!("predictive:category:{}", category.as_str()),
            CATEGORY_IDENTITY,
            category_window,
        );

        let current = self.counters.count(&client_key, window, now).await;
        let category_recent = self
            .counters
            .count(&category_key, category_window, now)
            .await;
        let category_rate = category_recent as f64
            / (category_window.num_seconds() as f64 / 60.0)
            / self.profiles.len().max(1) as f64;

        let evaluation = {
            let state = self.profile(&client, now);
            let mut profile = state.lock();
            profile.observe(now, self.config.history_capacity);
            let behavior = profile.reassess();

            let input = ModelInput {
                profile: &profile,
                now,
                window,
                bucket: self.config.bucket(),
                category_rate,
            };
            let prediction = match predict(rule.model, &input) {
                Ok(prediction) => prediction,
                Err(e) => {
                    self.fallbacks.fetch_add(1, Ordering::Relaxed);
                    trace!(client = %identity, error = %e, "Using default prediction");
                    Prediction::fallback()
                }
            };

            let dynamic_limit =
                rule.dynamic_limit(behavior.multiplier(), profile.trust_score, prediction.confidence);
            Evaluation {
                behavior,
                trust: profile.trust_score,
                prediction,
                dynamic_limit,
                threshold: rule.strategy.threshold(dynamic_limit, prediction.confidence),
                mean_interval: profile.interval_stats(1).map(|stats| stats.mean),
            }
        };

        let projected = current as f64 + evaluation.prediction.predicted;
        if projected > evaluation.threshold {
            let excess = projected - evaluation.threshold;
            let interval = evaluation.mean_interval.unwrap_or(1.0);
            let retry = ((interval * excess).ceil() as u64).clamp(1, rule.window_secs.max(1));
            self.denied.fetch_add(1, Ordering::Relaxed);

            debug!(
                client = %identity,
                category = category.as_str(),
                behavior = evaluation.behavior.as_str(),
                current = current,
                predicted = evaluation.prediction.predicted,
                threshold = evaluation.threshold,
                retry_after = retry,
                "Predicted load exceeds limit"
            );

            return self.annotate(Decision::deny(Dimension::Predictive, retry), &evaluation, current);
        }

        self.counters
            .record_all(&[client_key, category_key], now)
            .await;
        self.annotate(Decision::allow(), &evaluation, current)
    }

    fn annotate(&self, decision: Decision, evaluation: &Evaluation, current: u64) -> Decision {
        decision
            .with("behavior", evaluation.behavior.as_str())
            .with("trust_score", evaluation.trust)
            .with("predicted", evaluation.prediction.predicted)
            .with("confidence", evaluation.prediction.confidence)
            .with("dynamic_limit", evaluation.dynamic_limit)
            .with("current", current)
    }

    /// Get or create a profile, evicting the least recently active one when
    /// the profile cap is reached.
    fn profile(&self, client: &str, now: DateTime<Utc>) -> Arc<Mutex<ClientBehaviorProfile>> {
        if let Some(existing) = self.profiles.get(client) {
            return Arc::clone(existing.value());
        }
        if self.profiles.len() >= self.config.max_profiles {
            self.evict_least_recent();
        }
        let entry = self.profiles.entry(client.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ClientBehaviorProfile::new(
                now,
                self.config.initial_trust,
            )))
        });
        Arc::clone(entry.value())
    }

    fn evict_least_recent(&self) {
        let oldest = self
            .profiles
            .iter()
            .min_by_key(|entry| entry.value().lock().last_activity)
            .map(|entry| entry.key().clone());
        if let Some(client) = oldest {
            self.profiles.remove(&client);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(client = %client, "Evicted behavior profile at capacity");
        }
    }

    pub fn client_status(&self, identity: &ClientIdentity) -> Option<ClientPredictiveStatus> {
        let state = Arc::clone(self.profiles.get(&identity.key())?.value());
        let profile = state.lock();
        Some(ClientPredictiveStatus {
            behavior: profile.behavior,
            trust_score: profile.trust_score,
            requests_tracked: profile.history.len(),
            last_activity: profile.last_activity,
        })
    }

    /// Snapshot a client's profile.
    pub fn export_profile(&self, identity: &ClientIdentity) -> Option<ProfileSnapshot> {
        let state = Arc::clone(self.profiles.get(&identity.key())?.value());
        let profile = state.lock().clone();
        Some(ProfileSnapshot {
            client: identity.key(),
            exported_at: self.clock.now(),
            profile,
        })
    }

    /// Restore a profile, replacing any existing one for the same client.
    pub fn import_profile(&self, snapshot: ProfileSnapshot) -> Result<()> {
        snapshot.validate(self.config.history_capacity)?;
        info!(
            client = %snapshot.client,
            behavior = snapshot.profile.behavior.as_str(),
            trust = snapshot.profile.trust_score,
            "Imported behavior profile"
        );
        self.profiles
            .insert(snapshot.client, Arc::new(Mutex::new(snapshot.profile)));
        Ok(())
    }

    pub fn clear_client(&self, identity: &ClientIdentity) -> bool {
        self.profiles.remove(&identity.key()).is_some()
    }

    /// Evict profiles idle for longer than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now() - max_age;
        let before = self.profiles.len();
        self.profiles
            .retain(|_, state| state.lock().last_activity > cutoff);
        before - self.profiles.len()
    }

    pub fn stats(&self) -> PredictiveStats {
        PredictiveStats {
            checks: self.checks.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            model_fallbacks: self.fallbacks.load(Ordering::Relaxed),
            profiles: self.profiles.len(),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::predictive::models::PredictionModel;
    use crate::predictive::rules::{LimitStrategy, PredictiveRule};
    use chrono::TimeZone;

    fn setup(config: PredictiveConfig) -> (PredictiveLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 2, 12, 0, 0).unwrap());
        let limiter = PredictiveLimiter::new(config, Counters::in_memory(), Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn small_rule_config() -> PredictiveConfig {
        let mut rule =
            PredictiveRule::new(10, 60, PredictionModel::MovingAverage, LimitStrategy::Balanced);
        rule.min_limit = 1;
        rule.max_limit = 10;
        PredictiveConfig {
            default_rule: rule,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_steady_client_hits_predicted_limit() {
        let (limiter, clock) = setup(small_rule_config());
        let client = ClientIdentity::user("steady");

        let mut allowed = 0;
        let denial = loop {
            let decision = limiter.check(&client, RequestCategory::General).await;
            if !decision.allowed {
                break decision;
            }
            allowed += 1;
            clock.advance(Duration::seconds(1));
        };

        // The tenth request projects 9 recorded plus ~1.4 predicted over 10.
        assert_eq!(allowed, 9);
        assert_eq!(denial.dimension, Some(Dimension::Predictive));
        assert_eq!(denial.retry_after_secs, 1);
        assert_eq!(denial.metadata["behavior"], "steady");

        let status = limiter.client_status(&client).unwrap();
        assert_eq!(status.requests_tracked, 10);
        assert_eq!(status.trust_score, 1.0);
    }

    #[tokio::test]
    async fn test_model_failure_falls_back() {
        let mut config = PredictiveConfig::default();
        config.default_rule.model = PredictionModel::LinearRegression;
        let (limiter, _clock) = setup(config);
        let client = ClientIdentity::user("new");

        let decision = limiter.check(&client, RequestCategory::General).await;
        assert!(decision.allowed);
        assert_eq!(decision.metadata["predicted"], 0.0);
        assert_eq!(decision.metadata["confidence"], 0.1);
        assert_eq!(limiter.stats().model_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_profile_round_trip_is_exact() {
        let (limiter, clock) = setup(PredictiveConfig::default());
        let client = ClientIdentity::user("roundtrip");
        for gap in [0.2, 0.6, 0.2, 0.6, 0.2] {
            limiter.check(&client, RequestCategory::Search).await;
            clock.advance_secs_f64(gap);
        }

        let snapshot = limiter.export_profile(&client).unwrap();
        assert_eq!(snapshot.profile.behavior, BehaviorClass::Suspicious);
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: ProfileSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);

        limiter.clear_client(&client);
        limiter.import_profile(restored).unwrap();
        let status = limiter.client_status(&client).unwrap();
        assert_eq!(status.trust_score, snapshot.profile.trust_score);
        assert_eq!(status.behavior, BehaviorClass::Suspicious);
    }

    #[tokio::test]
    async fn test_import_rejects_bad_trust() {
        let (limiter, clock) = setup(PredictiveConfig::default());
        let mut profile = ClientBehaviorProfile::new(clock.now(), 1.0);
        profile.trust_score = 1.5;
        let snapshot = ProfileSnapshot {
            client: "user:bad".into(),
            exported_at: clock.now(),
            profile,
        };
        assert!(limiter.import_profile(snapshot).is_err());
        assert_eq!(limiter.stats().profiles, 0);
    }

    #[tokio::test]
    async fn test_profile_cap_and_idle_eviction() {
        let config = PredictiveConfig {
            max_profiles: 2,
            ..Default::default()
        };
        let (limiter, clock) = setup(config);

        for id in ["a", "b", "c"] {
            limiter.check(&ClientIdentity::user(id), RequestCategory::General).await;
            clock.advance(Duration::seconds(10));
        }
        assert_eq!(limiter.stats().profiles, 2);
        assert_eq!(limiter.stats().evicted, 1);
        assert!(limiter.client_status(&ClientIdentity::user("a")).is_none());

        clock.advance(Duration::hours(2));
        assert_eq!(limiter.cleanup(Duration::hours(1)), 2);
    }
}
