//! Predictive limiting from per-client behavior profiles.

mod limiter;
mod models;
mod profile;
mod rules;

pub use self::limiter::{ClientPredictiveStatus, PredictiveLimiter, PredictiveStats};
pub use self::models::{predict, ModelInput, Prediction, PredictionModel};
pub use self::profile::{
    BehaviorClass, ClientBehaviorProfile, IntervalStats, ProfileSnapshot, MAX_TRUST, MIN_TRUST,
};
pub use self::rules::{LimitStrategy, PredictiveConfig, PredictiveRule};
