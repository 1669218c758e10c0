//! Behavioral abuse detection with escalating penalties.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::event::{AbuseIncident, AbuseLevel, AbuseType, IncidentAction, RequestEvent};
use super::metrics::{AbuseMetrics, MetricFidelity};
use super::rules::AbuseConfig;
use crate::clock::Clock;
use crate::decision::{retry_after, Decision, Dimension};
use crate::identity::ClientIdentity;
use crate::penalty::EscalationLevel;
use crate::store::{CounterKey, Counters};

const REQUESTS_DIMENSION: &str = "abuse:requests";

/// Per-client detector state.
struct ClientHistory {
    events: VecDeque<RequestEvent>,
    incidents: Vec<AbuseIncident>,
    /// Last full metric computation
    cached: Option<(DateTime<Utc>, AbuseMetrics)>,
    last_seen: DateTime<Utc>,
}

impl ClientHistory {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            events: VecDeque::new(),
            incidents: Vec::new(),
            cached: None,
            last_seen: now,
        }
    }

    /// Drop events and incidents at or before `cutoff`, then trim events to
    /// `capacity`. Escalation only ever sees incidents inside the retention
    /// period.
    fn prune(&mut self, cutoff: DateTime<Utc>, capacity: usize) {
        while matches!(self.events.front(), Some(e) if e.timestamp <= cutoff) {
            self.events.pop_front();
        }
        while self.events.len() > capacity {
            self.events.pop_front();
        }
        self.incidents.retain(|incident| incident.timestamp > cutoff);
    }
}

/// Snapshot of one client's detector state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAbuseStatus {
    pub events: usize,
    pub incidents: usize,
    pub escalation_level: u8,
    pub last_incident: Option<AbuseIncident>,
}

/// Aggregate detector counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbuseStats {
    pub checks: u64,
    pub incidents: u64,
    pub throttled: u64,
    pub tracked_clients: usize,
    pub tracked_signatures: usize,
    pub incidents_by_type: BTreeMap<String, u64>,
}

/// Classifies clients from their recent behavior and throttles the abusive
/// ones.
pub struct AbuseDetector {
    config: AbuseConfig,
    counters: Counters,
    clock: Arc<dyn Clock>,
    clients: DashMap<String, Arc<Mutex<ClientHistory>>>,
    /// Parameter signature -> client -> last seen
    signatures: DashMap<u64, HashMap<String, DateTime<Utc>>>,
    checks: AtomicU64,
    incidents: AtomicU64,
    throttled: AtomicU64,
    by_type: Mutex<BTreeMap<AbuseType, u64>>,
}

impl AbuseDetector {
    pub fn new(config: AbuseConfig, counters: Counters, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            counters,
            clock,
            clients: DashMap::new(),
            signatures: DashMap::new(),
            checks: AtomicU64::new(0),
            incidents: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            by_type: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &AbuseConfig {
        &self.config
    }

    fn request_key(&self, client: &str) -> CounterKey {
        CounterKey::new(REQUESTS_DIMENSION, client, self.config.level_limits.retention())
    }

    fn history(&self, client: &str, now: DateTime<Utc>) -> Arc<Mutex<ClientHistory>> {
        self.clients
            .entry(client.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ClientHistory::new(now))))
            .clone()
    }

    /// Append a completed request to the client's history.
    pub fn record_event(&self, identity: &ClientIdentity, event: RequestEvent) {
        let now = self.clock.now();
        let client = identity.key();

        if let Some(signature) = event.parameter_signature() {
            self.note_signature(signature, &client, event.timestamp);
        }

        let state = self.history(&client, now);
        let mut history = state.lock();
        history.events.push_back(event);
        history.last_seen = now;
        history.prune(now - self.config.retention(), self.config.history_capacity);
    }

    fn note_signature(&self, signature: u64, client: &str, at: DateTime<Utc>) {
        if !self.signatures.contains_key(&signature)
            && self.signatures.len() >= self.config.max_tracked_signatures
        {
            trace!(signature = signature, "Signature map full, not tracking");
            return;
        }
        self.signatures
            .entry(signature)
            .or_default()
            .insert(client.to_string(), at);
    }

    /// Evaluate a client's recent behavior.
    ///
    /// Metric computation never fails the check: with degraded fidelity some
    /// abuse types simply cannot score.
    pub async fn check(&self, identity: &ClientIdentity, fidelity: MetricFidelity) -> Decision {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let client = identity.key();
        let request_key = self.request_key(&client);

        let state = self.clients.get(&client).map(|entry| entry.value().clone());
        let assessment = state.and_then(|state| {
            let mut history = state.lock();
            history.prune(now - self.config.retention(), self.config.history_capacity);
            history.last_seen = now;
            let metrics = self.metrics_for(&mut history, now, fidelity);
            let prior = history.incidents.len();
            drop(history);

            let (abuse_type, confidence) = metrics.classify(&self.config.thresholds)?;
            Some((abuse_type, confidence, metrics, prior, state))
        });

        let Some((abuse_type, confidence, metrics, prior, state)) = assessment else {
            trace!(client = %identity, "No abuse signals");
            self.counters.record(&request_key, now).await;
            return Decision::allow();
        };

        let level = AbuseLevel::from_confidence(confidence);
        let escalation = EscalationLevel::from_count(prior);
        let rule = self.config.level_limits.get(level);
        let limit = escalation.apply(rule.max_requests);
        let window = rule.window();

        let count = self.counters.count(&request_key, window, now).await;
        let throttle = count >= limit;
        let decision = if throttle {
            let oldest = self.counters.oldest(&request_key, window, now).await;
            let retry = retry_after(window, oldest, now);
            self.throttled.fetch_add(1, Ordering::Relaxed);
            debug!(
                client = %identity,
                abuse_type = abuse_type.as_str(),
                level = level.as_str(),
                count = count,
                limit = limit,
                retry_after = retry,
                "Abuse limit exceeded"
            );
            Decision::deny(Dimension::Abuse, retry)
        } else {
            self.counters.record(&request_key, now).await;
            Decision::allow()
        };

        let mut actions = vec![IncidentAction::Logged];
        if throttle {
            actions.push(IncidentAction::Throttled);
        }

        info!(
            client = %identity,
            abuse_type = abuse_type.as_str(),
            level = level.as_str(),
            confidence = confidence,
            escalation = escalation.level(),
            "Abuse incident recorded"
        );

        state.lock().incidents.push(AbuseIncident {
            timestamp: now,
            client: client.clone(),
            abuse_type,
            level,
            confidence,
            metrics,
            actions,
        });
        self.incidents.fetch_add(1, Ordering::Relaxed);
        *self.by_type.lock().entry(abuse_type).or_insert(0) += 1;

        decision
            .with("abuse_type", abuse_type.as_str())
            .with("abuse_level", level.as_str())
            .with("confidence", confidence)
            .with("escalation_level", escalation.level())
            .with("effective_limit", limit)
    }

    fn metrics_for(
        &self,
        history: &mut ClientHistory,
        now: DateTime<Utc>,
        fidelity: MetricFidelity,
    ) -> AbuseMetrics {
        if fidelity == MetricFidelity::Cached {
            if let Some((at, cached)) = &history.cached {
                if now - *at < self.config.cache_ttl() {
                    return cached.clone();
                }
            }
        }

        let full = fidelity == MetricFidelity::Full;
        let cutoff = now - self.config.analysis_window();
        let recent: Vec<&RequestEvent> = history
            .events
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .collect();

        let mut metrics = AbuseMetrics::compute(
            recent.iter().copied(),
            now,
            if full {
                MetricFidelity::Full
            } else {
                MetricFidelity::Reduced
            },
        );

        if full {
            let signatures: HashSet<u64> =
                recent.iter().filter_map(|e| e.parameter_signature()).collect();
            metrics.distributed_clients = signatures
                .iter()
                .filter_map(|signature| {
                    self.signatures
                        .get(signature)
                        .map(|clients| clients.values().filter(|seen| **seen > cutoff).count())
                })
                .max()
                .unwrap_or(0);
            history.cached = Some((now, metrics.clone()));
        }

        metrics
    }

    pub fn incidents(&self, identity: &ClientIdentity) -> Vec<AbuseIncident> {
        self.clients
            .get(&identity.key())
            .map(|state| state.lock().incidents.clone())
            .unwrap_or_default()
    }

    pub fn client_status(&self, identity: &ClientIdentity) -> Option<ClientAbuseStatus> {
        let state = self.clients.get(&identity.key())?.value().clone();
        let history = state.lock();
        Some(ClientAbuseStatus {
            events: history.events.len(),
            incidents: history.incidents.len(),
            escalation_level: EscalationLevel::from_count(history.incidents.len()).level(),
            last_incident: history.incidents.last().cloned(),
        })
    }

    /// Drop a client's history, incidents and signature entries.
    pub fn clear_client(&self, identity: &ClientIdentity) -> bool {
        let client = identity.key();
        self.signatures.retain(|_, clients| {
            clients.remove(&client);
            !clients.is_empty()
        });
        self.clients.remove(&client).is_some()
    }

    /// Drop incidents older than `max_age`, prune histories and forget idle
    /// clients. Returns the number of clients removed.
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let now = self.clock.now();
        let cutoff = now - max_age;
        let event_cutoff = now - self.config.retention();
        let signature_cutoff = now - self.config.analysis_window();

        let before = self.clients.len();
        self.clients.retain(|_, state| {
            let mut history = state.lock();
            history.prune(event_cutoff, self.config.history_capacity);
            history.incidents.retain(|incident| incident.timestamp > cutoff);
            !(history.last_seen <= cutoff && history.events.is_empty() && history.incidents.is_empty())
        });
        self.signatures.retain(|_, clients| {
            clients.retain(|_, seen| *seen > signature_cutoff);
            !clients.is_empty()
        });

        before - self.clients.len()
    }

    pub fn stats(&self) -> AbuseStats {
        AbuseStats {
            checks: self.checks.load(Ordering::Relaxed),
            incidents: self.incidents.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            tracked_clients: self.clients.len(),
            tracked_signatures: self.signatures.len(),
            incidents_by_type: self
                .by_type
                .lock()
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), *n))
                .collect(),
        }
    }
}
