//! Geographic admission.

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::location::{GeoLocation, GeoResolver};
use super::quota::RegionalQuota;
use super::rules::{GeoConfig, RegionRule, RegionalQuotaRule};
use crate::clock::Clock;
use crate::decision::{retry_after, Decision, Dimension};
use crate::identity::ClientIdentity;
use crate::store::{CounterKey, Counters};

/// A resolved location and when it was resolved.
#[derive(Debug, Clone)]
struct CachedLocation {
    location: GeoLocation,
    resolved_at: DateTime<Utc>,
}

/// One scaled per-client regional limit.
struct RegionCheck {
    dimension: Dimension,
    region: String,
    key: CounterKey,
    limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoStats {
    pub checks: u64,
    pub blocked: u64,
    pub outside_service_hours: u64,
    pub region_limited: u64,
    pub quota_exhausted: u64,
    pub resolver_failures: u64,
    pub cached_locations: usize,
    pub tracked_regions: usize,
}

/// Limits traffic by where it comes from and the local time there.
pub struct GeoLimiter {
    config: GeoConfig,
    counters: Counters,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn GeoResolver>,
    locations: DashMap<IpAddr, CachedLocation>,
    /// Addresses the resolver could not place, and when it last tried.
    unresolved: DashMap<IpAddr, DateTime<Utc>>,
    quotas: DashMap<String, Arc<Mutex<RegionalQuota>>>,
    checks: AtomicU64,
    blocked: AtomicU64,
    outside_hours: AtomicU64,
    region_limited: AtomicU64,
    quota_exhausted: AtomicU64,
    resolver_failures: AtomicU64,
}

impl GeoLimiter {
    pub fn new(
        config: GeoConfig,
        counters: Counters,
        resolver: Arc<dyn GeoResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            counters,
            clock,
            resolver,
            locations: DashMap::new(),
            unresolved: DashMap::new(),
            quotas: DashMap::new(),
            checks: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            outside_hours: AtomicU64::new(0),
            region_limited: AtomicU64::new(0),
            quota_exhausted: AtomicU64::new(0),
            resolver_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GeoConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Location of an address, from cache while fresh.
    pub async fn locate(&self, ip: IpAddr) -> Option<GeoLocation> {
        let now = self.clock.now();
        if let Some(cached) = self.locations.get(&ip) {
            if now - cached.resolved_at < self.config.cache_staleness() {
                return Some(cached.location.clone());
            }
        }
        if let Some(failed_at) = self.unresolved.get(&ip) {
            if now - *failed_at < self.config.cache_staleness() {
                trace!(ip = %ip, "Location unknown, skipping resolver until stale");
                return None;
            }
        }

        match self.resolver.resolve(ip).await {
            Ok(location) => {
                self.unresolved.remove(&ip);
                self.locations.insert(
                    ip,
                    CachedLocation {
                        location: location.clone(),
                        resolved_at: now,
                    },
                );
                Some(location)
            }
            Err(e) => {
                self.resolver_failures.fetch_add(1, Ordering::Relaxed);
                self.unresolved.insert(ip, now);
                warn!(ip = %ip, resolver = self.resolver.name(), error = %e, "Geolocation failed, failing open");
                None
            }
        }
    }

    /// Check a request from `ip`.
    pub async fn check(&self, identity: &ClientIdentity, ip: IpAddr) -> Decision {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let Some(location) = self.locate(ip).await else {
            return Decision::allow().with("geo", "unresolved");
        };
        let now = self.clock.now();
        let local = now.with_timezone(&location.timezone);

        trace!(
            client = %identity,
            country = %location.country_code,
            province = %location.province,
            local_hour = local.hour(),
            "Checking geography"
        );

        if !location.is_domestic(&self.config.home_country) || location.is_vpn || location.is_proxy {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            let reason = if location.is_vpn {
                "vpn"
            } else if location.is_proxy {
                "proxy"
            } else {
                "foreign"
            };
            debug!(client = %identity, ip = %ip, reason = reason, "Blocked by location");
            return annotate(
                Decision::deny(Dimension::GeoBlock, self.config.block_retry_secs),
                &location,
                local.hour(),
            )
            .with("reason", reason);
        }

        let hours = self.config.service_hours_for(location.timezone);
        if !hours.is_open(&local) {
            self.outside_hours.fetch_add(1, Ordering::Relaxed);
            let retry = hours.secs_until_open(&local);
            debug!(client = %identity, local_hour = local.hour(), retry_after = retry, "Outside service hours");
            return annotate(
                Decision::deny(Dimension::ServiceHours, retry),
                &location,
                local.hour(),
            );
        }

        let client = identity.key();
        let checks = self.plan(&client, &location, &local);
        for check in &checks {
            let window = check.key.retention;
            let count = self.counters.count(&check.key, window, now).await;
            if count >= check.limit {
                let oldest = self.counters.oldest(&check.key, window, now).await;
                let retry = retry_after(window, oldest, now);
                self.region_limited.fetch_add(1, Ordering::Relaxed);
                debug!(
                    client = %identity,
                    dimension = ?check.dimension,
                    region = %check.region,
                    count = count,
                    limit = check.limit,
                    retry_after = retry,
                    "Regional limit exceeded"
                );
                return annotate(Decision::deny(check.dimension, retry), &location, local.hour())
                    .with("region", check.region.as_str())
                    .with("limit", check.limit)
                    .with("current", count);
            }
        }

        if let Some((region, retry)) = self.consume_quotas(&location, now) {
            self.quota_exhausted.fetch_add(1, Ordering::Relaxed);
            debug!(client = %identity, region = %region, retry_after = retry, "Regional quota exhausted");
            return annotate(
                Decision::deny(Dimension::RegionalQuota, retry),
                &location,
                local.hour(),
            )
            .with("region", region);
        }

        let keys: Vec<CounterKey> = checks.into_iter().map(|c| c.key).collect();
        self.counters.record_all(&keys, now).await;
        annotate(Decision::allow(), &location, local.hour())
    }

    /// Province, city and timezone limits applicable at this local time.
    fn plan(&self, client: &str, location: &GeoLocation, local: &DateTime<Tz>) -> Vec<RegionCheck> {
        let province = location.province.to_lowercase();
        let mut rules: Vec<(Dimension, String, RegionRule)> = vec![(
            Dimension::Region,
            format!("province:{}", province),
            self.config.province_rule(&province),
        )];
        if let Some(city) = &location.city {
            if let Some(rule) = self.config.city_rule(city) {
                rules.push((Dimension::City, format!("city:{}", city.to_lowercase()), rule));
            }
        }
        if let Some(rule) = self.config.timezone_rule(location.timezone) {
            rules.push((
                Dimension::Timezone,
                format!("timezone:{}", location.timezone.name().to_lowercase()),
                rule,
            ));
        }

        rules
            .into_iter()
            .map(|(dimension, region, rule)| RegionCheck {
                dimension,
                key: CounterKey::new(format!("geo:{}", region.replace('|', "_")), client, rule.window()),
                limit: rule.effective_limit(local),
                region,
            })
            .collect()
    }

    /// Check and consume the province and city quotas together. Returns the
    /// exhausted region and its retry-after if either has no room, in which
    /// case nothing is consumed.
    fn consume_quotas(&self, location: &GeoLocation, now: DateTime<Utc>) -> Option<(String, u64)> {
        let province = self.quota(
            format!("province:{}", location.province.to_lowercase()),
            self.config.province_quota,
            now,
        );
        let city = location
            .city
            .as_ref()
            .filter(|city| self.config.city_rule(city).is_some())
            .map(|city| {
                self.quota(
                    format!("city:{}", city.to_lowercase()),
                    self.config.city_quota,
                    now,
                )
            });

        // Province before city, always, so concurrent checks lock in the same order.
        let mut province_quota = province.lock();
        let mut city_quota = city.as_ref().map(|c| c.lock());

        if let Some(retry) = province_quota.exhausted_for(now) {
            return Some((province_quota.region.clone(), retry));
        }
        if let Some(quota) = city_quota.as_mut() {
            if let Some(retry) = quota.exhausted_for(now) {
                return Some((quota.region.clone(), retry));
            }
        }

        province_quota.consume();
        if let Some(quota) = city_quota.as_mut() {
            quota.consume();
        }
        None
    }

    fn quota(&self, region: String, rule: RegionalQuotaRule, now: DateTime<Utc>) -> Arc<Mutex<RegionalQuota>> {
        let entry = self
            .quotas
            .entry(region.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RegionalQuota::new(region, rule, now))));
        Arc::clone(entry.value())
    }

    /// Current usage of a regional quota, e.g. `city:beijing`.
    pub fn regional_usage(&self, region: &str) -> Option<RegionalQuota> {
        let quota = Arc::clone(self.quotas.get(region)?.value());
        let snapshot = quota.lock().clone();
        Some(snapshot)
    }

    /// Drop cached locations older than `max_age` or the staleness threshold
    /// and quotas whose periods have all elapsed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let horizon = max_age.min(self.config.cache_staleness());
        let tracked = || self.locations.len() + self.unresolved.len() + self.quotas.len();
        let before = tracked();
        self.locations
            .retain(|_, cached| now - cached.resolved_at < horizon);
        self.unresolved.retain(|_, failed_at| now - *failed_at < horizon);
        self.quotas.retain(|_, quota| !quota.lock().is_idle(now));
        before - tracked()
    }

    pub fn stats(&self) -> GeoStats {
        GeoStats {
            checks: self.checks.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            outside_service_hours: self.outside_hours.load(Ordering::Relaxed),
            region_limited: self.region_limited.load(Ordering::Relaxed),
            quota_exhausted: self.quota_exhausted.load(Ordering::Relaxed),
            resolver_failures: self.resolver_failures.load(Ordering::Relaxed),
            cached_locations: self.locations.len(),
            tracked_regions: self.quotas.len(),
        }
    }
}

fn annotate(decision: Decision, location: &GeoLocation, local_hour: u32) -> Decision {
    let decision = decision
        .with("country", location.country_code.as_str())
        .with("province", location.province.as_str())
        .with("timezone", location.timezone.name())
        .with("local_hour", local_hour);
    match &location.city {
        Some(city) => decision.with("city", city.as_str()),
        None => decision,
    }
}
