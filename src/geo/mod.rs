//! Geographic limiting.
//!
//! Requests are located through a [`GeoResolver`], blocked outright when they
//! come from abroad or through a VPN or proxy, held to local service hours and
//! then limited per province, city and timezone. Limits scale with local
//! business hours, weekends and regional risk. Major regions also carry
//! shared daily and hourly quotas.

mod limiter;
mod location;
mod quota;
mod rules;

pub use self::limiter::{GeoLimiter, GeoStats};
pub use self::location::{GeoLocation, GeoResolver, IpRange, StaticGeoResolver, StaticLocation};
pub use self::quota::RegionalQuota;
pub use self::rules::{
    parse_timezone, GeoConfig, RegionRule, RegionalQuotaRule, RiskLevel, ServiceHours,
};
