//! Volume quotas: global, per-client, burst, per-endpoint and per-category.

mod limiter;
mod rules;

pub use self::limiter::{ClientQuotaStatus, QuotaLimiter, QuotaStats};
pub use self::rules::{normalize_path, route_pattern, CategoryLimits, QuotaConfig};
