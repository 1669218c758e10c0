//! Behavioral abuse detection.
//!
//! The detector keeps a bounded history of completed requests per client,
//! derives [`AbuseMetrics`] over a short analysis window, classifies the
//! client and throttles it with limits that shrink as incidents accumulate.

mod detector;
mod event;
mod metrics;
mod rules;

pub use self::detector::{AbuseDetector, AbuseStats, ClientAbuseStatus};
pub use self::event::{AbuseIncident, AbuseLevel, AbuseType, IncidentAction, RequestEvent};
pub use self::metrics::{AbuseMetrics, MetricFidelity};
pub use self::rules::{AbuseConfig, AbuseThresholds, LevelLimits};
