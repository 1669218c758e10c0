//! Shared per-region usage caps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::rules::RegionalQuotaRule;

/// Daily and hourly usage of one province or city, shared by every client
/// in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionalQuota {
    pub region: String,
    pub daily_limit: u64,
    pub hourly_limit: u64,
    pub daily_used: u64,
    pub hourly_used: u64,
    pub daily_reset: DateTime<Utc>,
    pub hourly_reset: DateTime<Utc>,
}

impl RegionalQuota {
    pub fn new(region: impl Into<String>, rule: RegionalQuotaRule, now: DateTime<Utc>) -> Self {
        Self {
            region: region.into(),
            daily_limit: rule.daily,
            hourly_limit: rule.hourly,
            daily_used: 0,
            hourly_used: 0,
            daily_reset: now,
            hourly_reset: now,
        }
    }

    /// Start a new period for each counter whose period has elapsed.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        if now > self.daily_reset + Duration::days(1) {
            self.daily_used = 0;
            self.daily_reset = now;
        }
        if now > self.hourly_reset + Duration::hours(1) {
            self.hourly_used = 0;
            self.hourly_reset = now;
        }
    }

    /// Seconds until the quota has room again, or `None` if it has room now.
    pub fn exhausted_for(&mut self, now: DateTime<Utc>) -> Option<u64> {
        self.roll(now);
        let until = if self.daily_used >= self.daily_limit {
            self.daily_reset + Duration::days(1) - now
        } else if self.hourly_used >= self.hourly_limit {
            self.hourly_reset + Duration::hours(1) - now
        } else {
            return None;
        };
        Some((until.num_seconds() + 1).max(1) as u64)
    }

    pub fn consume(&mut self) {
        self.daily_used += 1;
        self.hourly_used += 1;
    }

    /// Whether both periods have elapsed, leaving nothing worth keeping.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        now > self.daily_reset + Duration::days(1) && now > self.hourly_reset + Duration::hours(1)
    }
}
