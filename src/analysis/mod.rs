//! Admission for analysis workloads.
//!
//! Each analysis is classified by [`Complexity`] and [`PayloadBucket`], then
//! checked against complexity, type, payload and tier budgets. An admitted
//! analysis holds an [`AnalysisTicket`] for its in-flight slot.

mod limiter;
mod rules;
mod types;

pub use self::limiter::{
    AnalysisLimiter, AnalysisStats, AnalysisTicket, AnalysisTypeStats, ClientAnalysisStatus,
};
pub use self::rules::{
    AnalysisConfig, ComplexityLimits, ComplexityRule, PayloadLimits, TierLimits, TypeLimits,
};
pub use self::types::{
    AnalysisOutcome, AnalysisRequest, AnalysisType, Complexity, PayloadBucket,
    INTENSIVE_PAYLOAD_BYTES,
};
