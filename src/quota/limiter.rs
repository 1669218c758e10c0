//! Hierarchical quota limiter.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::rules::{normalize_path, QuotaConfig};
use crate::clock::Clock;
use crate::config::LimitRule;
use crate::decision::{retry_after, Decision, Dimension, RequestCategory};
use crate::identity::{ClientIdentity, IdentityKind};
use crate::penalty::EscalationLevel;
use crate::store::{Acquisition, Allowance, CounterKey, Counters};

/// Identity used for the global counter.
const GLOBAL_IDENTITY: &str = "global";

/// One dimension evaluated for a request.
struct QuotaCheck {
    dimension: Dimension,
    allowance: Allowance,
}

/// Aggregate quota counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaStats {
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub exempt: u64,
    pub clients_with_violations: usize,
}

/// Per-client quota view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientQuotaStatus {
    pub violations: usize,
    pub escalation_level: u8,
}

/// The first gate every request passes through.
///
/// Checks run in a fixed order: global, client, burst, endpoint, then
/// category for sensitive paths. The store checks and records them in one
/// atomic acquisition, so concurrent requests cannot overshoot a limit and a
/// denied request records nothing.
pub struct QuotaLimiter {
    config: QuotaConfig,
    counters: Counters,
    clock: Arc<dyn Clock>,
    /// Recent denial timestamps per client, oldest first
    violations: DashMap<String, VecDeque<DateTime<Utc>>>,
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    exempt: AtomicU64,
}

impl QuotaLimiter {
    pub fn new(config: QuotaConfig, counters: Counters, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            counters,
            clock,
            violations: DashMap::new(),
            checks: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            exempt: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Check a request against every quota dimension.
    pub async fn check(&self, identity: &ClientIdentity, method: &str, path: &str) -> Decision {
        self.checks.fetch_add(1, Ordering::Relaxed);

        if self.config.is_exempt(path) || self.config.is_trusted(&identity.key()) {
            self.exempt.fetch_add(1, Ordering::Relaxed);
            return Decision::allow().with("quota", "exempt");
        }

        let now = self.clock.now();
        let category = RequestCategory::from_path(path);
        let level = self.escalation_level(&identity.key(), now);
        let checks = self.plan(identity, method, path, category, level);

        trace!(client = %identity, path = %path, checks = checks.len(), "Checking quota");

        let allowances: Vec<Allowance> = checks.iter().map(|c| c.allowance.clone()).collect();
        let (index, count) = match self.counters.acquire(&allowances, now).await {
            Acquisition::Granted => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                return Decision::allow()
                    .with("category", category.as_str())
                    .with("quota_escalation_level", level.level());
            }
            Acquisition::Exhausted { index, count } => (index.min(checks.len() - 1), count),
        };

        let check = &checks[index];
        let Allowance {
            key,
            window,
            max_requests,
        } = &check.allowance;
        let oldest = self.counters.oldest(key, *window, now).await;
        let retry = retry_after(*window, oldest, now);
        self.note_violation(&identity.key(), now);
        self.denied.fetch_add(1, Ordering::Relaxed);

        debug!(
            client = %identity,
            dimension = ?check.dimension,
            count = count,
            limit = *max_requests,
            retry_after = retry,
            "Quota exceeded"
        );

        Decision::deny(check.dimension, retry)
            .with("limit", *max_requests)
            .with("window_secs", window.num_seconds())
            .with("current", count)
            .with("category", category.as_str())
    }

    /// Build the ordered list of checks for a request.
    fn plan(
        &self,
        identity: &ClientIdentity,
        method: &str,
        path: &str,
        category: RequestCategory,
        level: EscalationLevel,
    ) -> Vec<QuotaCheck> {
        let client_key = identity.key();
        let client_rule = match identity.kind() {
            IdentityKind::User | IdentityKind::Api => self.config.per_user,
            IdentityKind::Ip | IdentityKind::Unverified => self.config.per_ip,
        };
        let endpoint_rule = self.config.endpoint_limit(method, path);
        let endpoint = format!(
            "{} {}",
            method.to_ascii_uppercase(),
            normalize_path(path).replace('|', "_")
        );

        let mut checks = vec![
            Self::check_for(Dimension::Global, "quota:global", GLOBAL_IDENTITY, self.config.global),
            Self::check_for(Dimension::Client, "quota:client", &client_key, client_rule),
            Self::check_for(Dimension::Burst, "quota:burst", &client_key, self.config.burst),
            Self::check_for(
                Dimension::Endpoint,
                &format!("quota:endpoint:{}", endpoint),
                &client_key,
                endpoint_rule,
            ),
        ];

        if let Some(rule) = self.config.categories.get(category) {
            let mut check = Self::check_for(
                Dimension::Category,
                &format!("quota:category:{}", category.as_str()),
                &client_key,
                rule,
            );
            check.allowance.max_requests = level.apply(rule.max_requests);
            checks.push(check);
        }

        checks
    }

    fn check_for(dimension: Dimension, name: &str, identity: &str, rule: LimitRule) -> QuotaCheck {
        QuotaCheck {
            dimension,
            allowance: Allowance::new(
                CounterKey::new(name, identity, rule.window()),
                rule.window(),
                rule.max_requests,
            ),
        }
    }

    fn retention(&self) -> Duration {
        Duration::seconds(self.config.violation_retention_secs as i64)
    }

    /// Escalation level from violations inside the retention period.
    fn escalation_level(&self, client: &str, now: DateTime<Utc>) -> EscalationLevel {
        let cutoff = now - self.retention();
        match self.violations.get_mut(client) {
            Some(mut history) => {
                while matches!(history.front(), Some(t) if *t <= cutoff) {
                    history.pop_front();
                }
                EscalationLevel::from_count(history.len())
            }
            None => EscalationLevel::default(),
        }
    }

    fn note_violation(&self, client: &str, now: DateTime<Utc>) {
        self.violations
            .entry(client.to_string())
            .or_default()
            .push_back(now);
    }

    pub fn client_status(&self, identity: &ClientIdentity) -> ClientQuotaStatus {
        let now = self.clock.now();
        let level = self.escalation_level(&identity.key(), now);
        let violations = self
            .violations
            .get(&identity.key())
            .map(|v| v.len())
            .unwrap_or(0);
        ClientQuotaStatus {
            violations,
            escalation_level: level.level(),
        }
    }

    pub fn stats(&self) -> QuotaStats {
        QuotaStats {
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            exempt: self.exempt.load(Ordering::Relaxed),
            clients_with_violations: self.violations.len(),
        }
    }

    /// Forget a client's violation history. Its counters are cleared through
    /// the shared store by the caller.
    pub fn clear_client(&self, identity: &ClientIdentity) -> bool {
        self.violations.remove(&identity.key()).is_some()
    }

    /// Drop violations older than `max_age`. Returns the number of clients
    /// whose history became empty.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now() - max_age;
        let before = self.violations.len();
        self.violations.retain(|_, history| {
            while matches!(history.front(), Some(t) if *t <= cutoff) {
                history.pop_front();
            }
            !history.is_empty()
        });
        before - self.violations.len()
    }
}
