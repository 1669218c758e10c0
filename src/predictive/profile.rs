//! Per-client behavior profiles.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{RampartError, Result};

/// Intervals considered when classifying behavior.
const CLASSIFY_SAMPLE: usize = 50;

pub const MIN_TRUST: f64 = 0.1;
pub const MAX_TRUST: f64 = 1.0;

/// Coarse request-timing pattern of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorClass {
    #[default]
    Normal,
    Steady,
    Bursty,
    Irregular,
    Suspicious,
}

impl BehaviorClass {
    /// Classify from the mean and coefficient of variation of request
    /// intervals, in seconds.
    pub fn from_intervals(mean: f64, cov: f64) -> Self {
        if cov < 0.3 {
            BehaviorClass::Steady
        } else if cov > 1.5 {
            BehaviorClass::Bursty
        } else if mean < 1.0 {
            BehaviorClass::Suspicious
        } else if cov > 0.8 {
            BehaviorClass::Irregular
        } else {
            BehaviorClass::Normal
        }
    }

    /// Limit multiplier.
    pub fn multiplier(&self) -> f64 {
        match self {
            BehaviorClass::Normal => 1.0,
            BehaviorClass::Steady => 1.2,
            BehaviorClass::Bursty => 0.7,
            BehaviorClass::Irregular => 0.9,
            BehaviorClass::Suspicious => 0.5,
        }
    }

    pub fn is_erratic(&self) -> bool {
        matches!(
            self,
            BehaviorClass::Bursty | BehaviorClass::Irregular | BehaviorClass::Suspicious
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorClass::Normal => "normal",
            BehaviorClass::Steady => "steady",
            BehaviorClass::Bursty => "bursty",
            BehaviorClass::Irregular => "irregular",
            BehaviorClass::Suspicious => "suspicious",
        }
    }
}

/// Mean and coefficient of variation of a client's recent request
/// intervals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
}

impl IntervalStats {
    pub fn cov(&self) -> f64 {
        if self.mean > 0.0 {
            self.std_dev / self.mean
        } else {
            f64::INFINITY
        }
    }
}

/// Everything the predictive limiter knows about one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientBehaviorProfile {
    pub behavior: BehaviorClass,
    pub trust_score: f64,
    /// Request timestamps, oldest first
    pub history: VecDeque<DateTime<Utc>>,
    /// Requests seen per hour of day (UTC)
    pub hourly: [u64; 24],
    /// Requests seen per weekday, Monday first
    pub daily: [u64; 7],
    /// Distinct calendar days with activity
    pub days_observed: u32,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ClientBehaviorProfile {
    pub fn new(now: DateTime<Utc>, initial_trust: f64) -> Self {
        Self {
            behavior: BehaviorClass::Normal,
            trust_score: initial_trust.clamp(MIN_TRUST, MAX_TRUST),
            history: VecDeque::new(),
            hourly: [0; 24],
            daily: [0; 7],
            days_observed: 0,
            first_seen: now,
            last_activity: now,
        }
    }

    /// Record a request.
    pub fn observe(&mut self, at: DateTime<Utc>, capacity: usize) {
        if (self.history.is_empty() && self.days_observed == 0)
            || at.date_naive() != self.last_activity.date_naive()
        {
            self.days_observed += 1;
        }

        self.history.push_back(at);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
        self.hourly[at.hour() as usize] += 1;
        self.daily[at.weekday().num_days_from_monday() as usize] += 1;
        self.last_activity = self.last_activity.max(at);
    }

    /// Requests strictly after `cutoff`.
    pub fn count_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.history.iter().rev().take_while(|t| **t > cutoff).count()
    }

    /// Request counts per bucket for the `buckets` most recent buckets ending
    /// at `now`, oldest first.
    pub fn bucket_counts(&self, now: DateTime<Utc>, bucket: Duration, buckets: usize) -> Vec<f64> {
        let mut counts = vec![0.0; buckets];
        let span = bucket * buckets as i32;
        let start = now - span;
        let bucket_ms = bucket.num_milliseconds().max(1);

        for t in self.history.iter().rev().take_while(|t| **t > start) {
            let offset = (*t - start).num_milliseconds();
            let index = (((offset - 1).max(0)) / bucket_ms) as usize;
            counts[index.min(buckets - 1)] += 1.0;
        }
        counts
    }

    /// Statistics over the most recent intervals, `None` with fewer than
    /// `min_intervals` of them.
    pub fn interval_stats(&self, min_intervals: usize) -> Option<IntervalStats> {
        let skip = self.history.len().saturating_sub(CLASSIFY_SAMPLE + 1);
        let recent: Vec<&DateTime<Utc>> = self.history.iter().skip(skip).collect();
        let intervals: Vec<f64> = recent
            .windows(2)
            .map(|pair| (*pair[1] - *pair[0]).num_microseconds().unwrap_or(0) as f64 / 1e6)
            .collect();

        if intervals.len() < min_intervals.max(1) {
            return None;
        }
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance =
            intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        Some(IntervalStats {
            count: intervals.len(),
            mean,
            std_dev: variance.sqrt(),
        })
    }

    /// Reclassify and nudge trust. Returns the new class.
    pub fn reassess(&mut self) -> BehaviorClass {
        let Some(stats) = self.interval_stats(3) else {
            self.behavior = BehaviorClass::Normal;
            return self.behavior;
        };
        let cov = stats.cov();
        self.behavior = BehaviorClass::from_intervals(stats.mean, cov);

        if matches!(self.behavior, BehaviorClass::Steady | BehaviorClass::Normal) && cov < 0.5 {
            self.trust_score += 0.01;
        } else if self.behavior.is_erratic() {
            self.trust_score -= 0.02;
        }
        self.trust_score = self.trust_score.clamp(MIN_TRUST, MAX_TRUST);
        self.behavior
    }
}

/// Serializable copy of a profile for export and import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub client: String,
    pub exported_at: DateTime<Utc>,
    pub profile: ClientBehaviorProfile,
}

impl ProfileSnapshot {
    /// Reject snapshots that could not have come from a live profile.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        let profile = &self.profile;
        if !(MIN_TRUST..=MAX_TRUST).contains(&profile.trust_score) {
            return Err(RampartError::InvalidSnapshot(format!(
                "{}: trust score {} out of range",
                self.client, profile.trust_score
            )));
        }
        if profile.history.len() > capacity {
            return Err(RampartError::InvalidSnapshot(format!(
                "{}: history of {} exceeds capacity {}",
                self.client,
                profile.history.len(),
                capacity
            )));
        }
        if profile
            .history
            .iter()
            .zip(profile.history.iter().skip(1))
            .any(|(a, b)| b < a)
        {
            return Err(RampartError::InvalidSnapshot(format!(
                "{}: history is not time ordered",
                self.client
            )));
        }
        Ok(())
    }
}
