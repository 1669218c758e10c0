//! Behavioral metrics over a client's recent requests, and their scores.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::event::{AbuseType, RequestEvent};
use super::rules::AbuseThresholds;

/// How much work a metric computation may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFidelity {
    /// Every metric
    #[default]
    Full,
    /// Counts and rates only
    Reduced,
    /// The last full computation if it is fresh, otherwise reduced
    Cached,
}

/// Metrics over the analysis window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbuseMetrics {
    pub fidelity: MetricFidelity,
    pub request_count: u64,
    /// Requests in the last minute of the window
    pub requests_per_minute: f64,
    pub error_rate: f64,
    pub mean_response_time_ms: f64,
    pub response_time_variance: f64,
    pub unique_endpoints: usize,
    pub parameter_variations: usize,
    pub user_agent_switches: usize,
    pub auth_attempts: u64,
    pub failed_auth: u64,
    pub auth_failure_rate: f64,
    /// Largest number of clients seen sharing one of this client's parameter
    /// signatures
    pub distributed_clients: usize,
}

impl AbuseMetrics {
    /// Compute metrics from events already narrowed to the analysis window.
    ///
    /// `Cached` is resolved by the caller, so it is treated as `Reduced` here.
    pub fn compute<'a, I>(events: I, now: DateTime<Utc>, fidelity: MetricFidelity) -> Self
    where
        I: IntoIterator<Item = &'a RequestEvent>,
    {
        let events: Vec<&RequestEvent> = events.into_iter().collect();
        let full = fidelity == MetricFidelity::Full;
        let minute_ago = now - Duration::seconds(60);

        let request_count = events.len() as u64;
        let last_minute = events.iter().filter(|e| e.timestamp > minute_ago).count();
        let errors = events.iter().filter(|e| e.is_error()).count();
        let auth_attempts = events.iter().filter(|e| e.is_auth()).count() as u64;
        let failed_auth = events.iter().filter(|e| e.is_failed_auth()).count() as u64;

        let mean_response_time_ms = if events.is_empty() {
            0.0
        } else {
            events.iter().map(|e| e.response_time_ms).sum::<f64>() / events.len() as f64
        };

        let mut metrics = AbuseMetrics {
            fidelity: if full {
                MetricFidelity::Full
            } else {
                MetricFidelity::Reduced
            },
            request_count,
            requests_per_minute: last_minute as f64,
            error_rate: ratio(errors as u64, request_count),
            mean_response_time_ms,
            auth_attempts,
            failed_auth,
            auth_failure_rate: ratio(failed_auth, auth_attempts),
            ..Default::default()
        };

        if full {
            metrics.response_time_variance = events
                .iter()
                .map(|e| (e.response_time_ms - mean_response_time_ms).powi(2))
                .sum::<f64>()
                / events.len().max(1) as f64;
            metrics.unique_endpoints = events
                .iter()
                .map(|e| e.endpoint.as_str())
                .collect::<HashSet<_>>()
                .len();
            metrics.parameter_variations = events
                .iter()
                .filter_map(|e| e.parameter_signature())
                .collect::<HashSet<_>>()
                .len();
            metrics.user_agent_switches = events
                .windows(2)
                .filter(|pair| match (&pair[0].user_agent, &pair[1].user_agent) {
                    (Some(a), Some(b)) => a != b,
                    _ => false,
                })
                .count();
        }

        metrics
    }

    /// Score one abuse type in `[0, 1]`.
    ///
    /// Zero below the threshold, `0.6` exactly at it, rising linearly and
    /// capped at `1.0`.
    pub fn score(&self, abuse_type: AbuseType, thresholds: &AbuseThresholds) -> f64 {
        match abuse_type {
            AbuseType::RapidRequests => {
                scale(self.requests_per_minute, thresholds.rapid_requests_per_minute)
            }
            AbuseType::BruteForce if self.auth_attempts >= thresholds.min_auth_attempts => {
                scale(self.auth_failure_rate, thresholds.auth_failure_rate)
            }
            AbuseType::Scraping => scale(
                self.unique_endpoints as f64,
                thresholds.unique_endpoints as f64,
            )
            .max(scale(
                self.parameter_variations as f64,
                thresholds.parameter_variations as f64,
            )),
            AbuseType::ApiAbuse if self.request_count >= thresholds.min_requests => {
                scale(self.error_rate, thresholds.error_rate)
            }
            AbuseType::SuspiciousPattern => scale(
                self.user_agent_switches as f64,
                thresholds.user_agent_switches as f64,
            ),
            AbuseType::ResourceExhaustion if self.request_count >= thresholds.min_requests => {
                scale(self.mean_response_time_ms, thresholds.slow_response_ms)
            }
            AbuseType::DistributedAttack => scale(
                self.distributed_clients as f64,
                thresholds.distributed_clients as f64,
            ),
            _ => 0.0,
        }
    }

    /// The highest scoring type. Ties keep the earlier type in declaration
    /// order; a zero best score means nothing was detected.
    pub fn classify(&self, thresholds: &AbuseThresholds) -> Option<(AbuseType, f64)> {
        let mut best: Option<(AbuseType, f64)> = None;
        for abuse_type in AbuseType::ALL {
            let score = self.score(abuse_type, thresholds);
            if score > best.map(|(_, s)| s).unwrap_or(0.0) {
                best = Some((abuse_type, score));
            }
        }
        best
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn scale(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 || value < threshold {
        return 0.0;
    }
    (0.6 * value / threshold).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn events(n: usize, f: impl Fn(usize) -> RequestEvent) -> Vec<RequestEvent> {
        (0..n).map(f).collect()
    }

    #[test]
    fn test_scale_shape() {
        assert_eq!(scale(10.0, 50.0), 0.0);
        assert_eq!(scale(49.0, 50.0), 0.0);
        assert!((scale(50.0, 50.0) - 0.6).abs() < 1e-9);
        assert!((scale(75.0, 50.0) - 0.9).abs() < 1e-9);
        assert_eq!(scale(500.0, 50.0), 1.0);
    }

    #[test]
    fn test_full_metrics() {
        let now = now();
        let history = events(4, |i| {
            RequestEvent::new(now - Duration::seconds(90 - i as i64 * 20), "GET", format!("/api/p/{}", i % 2), 200)
                .with_response_time_ms(100.0 * (i + 1) as f64)
                .with_user_agent(if i % 2 == 0 { "curl" } else { "firefox" })
                .with_parameter("page", i.to_string())
        });

        let metrics = AbuseMetrics::compute(&history, now, MetricFidelity::Full);
        assert_eq!(metrics.request_count, 4);
        assert_eq!(metrics.requests_per_minute, 2.0);
        assert_eq!(metrics.unique_endpoints, 2);
        assert_eq!(metrics.parameter_variations, 4);
        assert_eq!(metrics.user_agent_switches, 3);
        assert_eq!(metrics.mean_response_time_ms, 250.0);
        assert_eq!(metrics.response_time_variance, 12_500.0);
    }

    #[test]
    fn test_reduced_metrics_skip_cardinalities() {
        let now = now();
        let history = events(5, |i| {
            RequestEvent::new(now, "POST", "/auth/login", 401)
                .with_user_agent(format!("agent-{}", i))
        });

        let metrics = AbuseMetrics::compute(&history, now, MetricFidelity::Reduced);
        assert_eq!(metrics.fidelity, MetricFidelity::Reduced);
        assert_eq!(metrics.auth_failure_rate, 1.0);
        assert_eq!(metrics.user_agent_switches, 0);
        assert_eq!(metrics.unique_endpoints, 0);
    }

    #[test]
    fn test_brute_force_needs_enough_attempts() {
        let thresholds = AbuseThresholds::default();
        let mut metrics = AbuseMetrics {
            auth_attempts: 2,
            failed_auth: 2,
            auth_failure_rate: 1.0,
            ..Default::default()
        };
        assert_eq!(metrics.score(AbuseType::BruteForce, &thresholds), 0.0);

        metrics.auth_attempts = 3;
        metrics.failed_auth = 3;
        assert!(metrics.score(AbuseType::BruteForce, &thresholds) > 0.7);
    }

    #[test]
    fn test_classify_tie_break_by_declaration_order() {
        let thresholds = AbuseThresholds::default();
        // Both scraping and suspicious-pattern sit exactly at threshold.
        let metrics = AbuseMetrics {
            unique_endpoints: thresholds.unique_endpoints,
            user_agent_switches: thresholds.user_agent_switches,
            ..Default::default()
        };
        let (abuse_type, score) = metrics.classify(&thresholds).unwrap();
        assert_eq!(abuse_type, AbuseType::Scraping);
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_just_below_thresholds_scores_nothing() {
        let thresholds = AbuseThresholds::default();
        let metrics = AbuseMetrics {
            unique_endpoints: thresholds.unique_endpoints - 1,
            parameter_variations: thresholds.parameter_variations - 1,
            user_agent_switches: thresholds.user_agent_switches - 1,
            requests_per_minute: thresholds.rapid_requests_per_minute - 1.0,
            ..Default::default()
        };
        assert!(metrics.classify(&thresholds).is_none());
    }

    #[test]
    fn test_classify_nothing() {
        assert!(AbuseMetrics::default()
            .classify(&AbuseThresholds::default())
            .is_none());
    }
}
