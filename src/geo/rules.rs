//! Geographic limit definitions.

use chrono::{DateTime, Datelike, Duration, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::location::{GeoLocation, StaticLocation};
use crate::config::LimitRule;
use crate::error::{RampartError, Result};

/// Risk assigned to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn multiplier(&self) -> f64 {
        match self {
            RiskLevel::Low => 1.2,
            RiskLevel::Medium => 1.0,
            RiskLevel::High => 0.8,
            RiskLevel::Critical => 0.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Per-client limit for one province, city or timezone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionRule {
    #[serde(flatten)]
    pub limit: LimitRule,

    #[serde(default)]
    pub risk: RiskLevel,

    /// Local business hours, `[start, end)`
    #[serde(default = "default_active_start")]
    pub active_start_hour: u32,
    #[serde(default = "default_active_end")]
    pub active_end_hour: u32,

    #[serde(default = "default_business_multiplier")]
    pub business_multiplier: f64,
    #[serde(default = "default_weekend_multiplier")]
    pub weekend_multiplier: f64,
}

fn default_active_start() -> u32 {
    9
}

fn default_active_end() -> u32 {
    18
}

fn default_business_multiplier() -> f64 {
    1.5
}

fn default_weekend_multiplier() -> f64 {
    0.8
}

impl RegionRule {
    pub fn new(max_requests: u64, window_secs: u64, risk: RiskLevel) -> Self {
        Self {
            limit: LimitRule::new(max_requests, window_secs),
            risk,
            active_start_hour: default_active_start(),
            active_end_hour: default_active_end(),
            business_multiplier: default_business_multiplier(),
            weekend_multiplier: default_weekend_multiplier(),
        }
    }

    pub fn window(&self) -> Duration {
        self.limit.window()
    }

    /// The limit at a local time, rounded and never below 1.
    pub fn effective_limit(&self, local: &DateTime<Tz>) -> u64 {
        let mut multiplier = self.risk.multiplier();
        if (self.active_start_hour..self.active_end_hour).contains(&local.hour()) {
            multiplier *= self.business_multiplier;
        }
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            multiplier *= self.weekend_multiplier;
        }
        ((self.limit.max_requests as f64 * multiplier).round() as u64).max(1)
    }

    fn validate(&self, name: &str) -> Result<()> {
        self.limit.validate(name)?;
        if self.active_start_hour > self.active_end_hour || self.active_end_hour > 24 {
            return Err(RampartError::Config(format!(
                "{}: active hours {}..{} are not a valid range",
                name, self.active_start_hour, self.active_end_hour
            )));
        }
        if self.business_multiplier <= 0.0 || self.weekend_multiplier <= 0.0 {
            return Err(RampartError::Config(format!(
                "{}: multipliers must be > 0",
                name
            )));
        }
        Ok(())
    }
}

/// Shared daily and hourly caps for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionalQuotaRule {
    pub daily: u64,
    pub hourly: u64,
}

/// Local hours during which traffic is served, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for ServiceHours {
    fn default() -> Self {
        Self {
            start_hour: 6,
            end_hour: 23,
        }
    }
}

impl ServiceHours {
    pub fn is_open(&self, local: &DateTime<Tz>) -> bool {
        (self.start_hour..self.end_hour).contains(&local.hour())
    }

    /// Seconds until the next opening, at least 1.
    pub fn secs_until_open(&self, local: &DateTime<Tz>) -> u64 {
        let today = local.date_naive();
        let day = if local.hour() < self.start_hour {
            Some(today)
        } else {
            today.succ_opt()
        };
        day.and_then(|d| d.and_hms_opt(self.start_hour, 0, 0))
            .map(|opening| (opening - local.naive_local()).num_seconds())
            .unwrap_or(0)
            .max(1) as u64
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            return Err(RampartError::Config(format!(
                "{}: service hours {}..{} are not a valid range",
                name, self.start_hour, self.end_hour
            )));
        }
        Ok(())
    }
}

/// Resolve a timezone name without regard to case.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok().or_else(|| {
        chrono_tz::TZ_VARIANTS
            .iter()
            .find(|tz| tz.name().eq_ignore_ascii_case(name))
            .copied()
    })
}

/// Geographic limiter configuration.
///
/// Province, city and timezone maps are keyed by lowercase names; timezone
/// keys are IANA names such as `asia/shanghai`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Country whose traffic is served
    #[serde(default = "default_home_country")]
    pub home_country: String,

    /// How long a resolved location is trusted
    #[serde(default = "default_cache_staleness")]
    pub cache_staleness_secs: u64,

    /// Retry-after for blocked traffic
    #[serde(default = "default_block_retry")]
    pub block_retry_secs: u64,

    /// Rule for provinces without their own
    #[serde(default = "default_province")]
    pub default_province: RegionRule,

    #[serde(default)]
    pub provinces: HashMap<String, RegionRule>,

    /// Major cities with their own limits and quotas
    #[serde(default = "default_cities")]
    pub cities: HashMap<String, RegionRule>,

    #[serde(default = "default_timezones")]
    pub timezones: HashMap<String, RegionRule>,

    #[serde(default = "default_province_quota")]
    pub province_quota: RegionalQuotaRule,

    #[serde(default = "default_city_quota")]
    pub city_quota: RegionalQuotaRule,

    #[serde(default)]
    pub default_service_hours: ServiceHours,

    /// Service hours overrides per timezone
    #[serde(default)]
    pub service_hours: HashMap<String, ServiceHours>,

    /// Address table for the built-in static resolver
    #[serde(default)]
    pub static_locations: Vec<StaticLocation>,

    /// Location for addresses outside the static table
    #[serde(default)]
    pub default_location: Option<GeoLocation>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            home_country: default_home_country(),
            cache_staleness_secs: default_cache_staleness(),
            block_retry_secs: default_block_retry(),
            default_province: default_province(),
            provinces: HashMap::new(),
            cities: default_cities(),
            timezones: default_timezones(),
            province_quota: default_province_quota(),
            city_quota: default_city_quota(),
            default_service_hours: ServiceHours::default(),
            service_hours: HashMap::new(),
            static_locations: Vec::new(),
            default_location: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_home_country() -> String {
    "CN".to_string()
}

fn default_cache_staleness() -> u64 {
    3600
}

fn default_block_retry() -> u64 {
    86_400
}

fn default_province() -> RegionRule {
    RegionRule::new(200, 60, RiskLevel::Medium)
}

fn default_cities() -> HashMap<String, RegionRule> {
    ["beijing", "shanghai", "guangzhou", "shenzhen"]
        .into_iter()
        .map(|city| (city.to_string(), RegionRule::new(300, 60, RiskLevel::Low)))
        .collect()
}

fn default_timezones() -> HashMap<String, RegionRule> {
    HashMap::from([(
        "asia/shanghai".to_string(),
        RegionRule::new(500, 60, RiskLevel::Medium),
    )])
}

fn default_province_quota() -> RegionalQuotaRule {
    RegionalQuotaRule {
        daily: 100_000,
        hourly: 10_000,
    }
}

fn default_city_quota() -> RegionalQuotaRule {
    RegionalQuotaRule {
        daily: 50_000,
        hourly: 5_000,
    }
}

fn lowercase_keys<V>(map: &mut HashMap<String, V>) {
    *map = std::mem::take(map)
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();
}

impl GeoConfig {
    pub fn normalize(&mut self) {
        lowercase_keys(&mut self.provinces);
        lowercase_keys(&mut self.cities);
        lowercase_keys(&mut self.timezones);
        lowercase_keys(&mut self.service_hours);
    }

    pub fn cache_staleness(&self) -> Duration {
        Duration::seconds(self.cache_staleness_secs as i64)
    }

    pub fn province_rule(&self, province: &str) -> RegionRule {
        self.provinces
            .get(&province.to_lowercase())
            .copied()
            .unwrap_or(self.default_province)
    }

    pub fn city_rule(&self, city: &str) -> Option<RegionRule> {
        self.cities.get(&city.to_lowercase()).copied()
    }

    pub fn timezone_rule(&self, tz: Tz) -> Option<RegionRule> {
        self.timezones.get(&tz.name().to_lowercase()).copied()
    }

    pub fn service_hours_for(&self, tz: Tz) -> ServiceHours {
        self.service_hours
            .get(&tz.name().to_lowercase())
            .copied()
            .unwrap_or(self.default_service_hours)
    }

    pub fn validate(&self) -> Result<()> {
        if self.home_country.trim().is_empty() {
            return Err(RampartError::Config("geo.home_country must be set".to_string()));
        }
        if self.cache_staleness_secs == 0 {
            return Err(RampartError::Config(
                "geo.cache_staleness_secs must be > 0".to_string(),
            ));
        }
        self.default_province.validate("geo.default_province")?;
        for (name, rule) in &self.provinces {
            rule.validate(&format!("geo.provinces.{}", name))?;
        }
        for (name, rule) in &self.cities {
            rule.validate(&format!("geo.cities.{}", name))?;
        }
        for (name, rule) in &self.timezones {
            if parse_timezone(name).is_none() {
                return Err(RampartError::Config(format!(
                    "geo.timezones: unknown timezone '{}'",
                    name
                )));
            }
            rule.validate(&format!("geo.timezones.{}", name))?;
        }
        self.default_service_hours
            .validate("geo.default_service_hours")?;
        for (name, hours) in &self.service_hours {
            if parse_timezone(name).is_none() {
                return Err(RampartError::Config(format!(
                    "geo.service_hours: unknown timezone '{}'",
                    name
                )));
            }
            hours.validate(&format!("geo.service_hours.{}", name))?;
        }
        for (name, quota) in [("province_quota", self.province_quota), ("city_quota", self.city_quota)] {
            if quota.daily == 0 || quota.hourly == 0 {
                return Err(RampartError::Config(format!(
                    "geo.{}: daily and hourly must be > 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Shanghai;

    #[test]
    fn test_effective_limit_multipliers() {
        let rule = RegionRule::new(10, 60, RiskLevel::Medium);
        // Monday 10:00 local
        let business = Shanghai.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap();
        assert_eq!(rule.effective_limit(&business), 15);
        // Monday 20:00 local
        let evening = Shanghai.with_ymd_and_hms(2024, 9, 2, 20, 0, 0).unwrap();
        assert_eq!(rule.effective_limit(&evening), 10);
        // Saturday 20:00 local
        let weekend = Shanghai.with_ymd_and_hms(2024, 9, 7, 20, 0, 0).unwrap();
        assert_eq!(rule.effective_limit(&weekend), 8);

        let critical = RegionRule::new(1, 60, RiskLevel::Critical);
        assert_eq!(critical.effective_limit(&evening), 1);
    }

    #[test]
    fn test_service_hours() {
        let hours = ServiceHours::default();
        let early = Shanghai.with_ymd_and_hms(2024, 9, 2, 3, 0, 0).unwrap();
        assert!(!hours.is_open(&early));
        assert_eq!(hours.secs_until_open(&early), 3 * 3600);

        let late = Shanghai.with_ymd_and_hms(2024, 9, 2, 23, 30, 0).unwrap();
        assert!(!hours.is_open(&late));
        assert_eq!(hours.secs_until_open(&late), 6 * 3600 + 30 * 60);

        let noon = Shanghai.with_ymd_and_hms(2024, 9, 2, 12, 0, 0).unwrap();
        assert!(hours.is_open(&noon));
    }

    #[test]
    fn test_timezone_lookup_ignores_case() {
        assert_eq!(parse_timezone("asia/shanghai"), Some(Shanghai));
        assert_eq!(parse_timezone("Asia/Shanghai"), Some(Shanghai));
        assert_eq!(parse_timezone("Mars/Olympus"), None);

        let config = GeoConfig::default();
        assert_eq!(config.timezone_rule(Shanghai).unwrap().limit.max_requests, 500);
        assert!(config.city_rule("Beijing").is_some());
        assert_eq!(config.province_rule("Hebei").limit.max_requests, 200);
    }

    #[test]
    fn test_validation() {
        assert!(GeoConfig::default().validate().is_ok());

        let mut config = GeoConfig::default();
        config
            .timezones
            .insert("mars/olympus".into(), RegionRule::new(1, 60, RiskLevel::Low));
        assert!(matches!(config.validate(), Err(RampartError::Config(_))));

        let mut config = GeoConfig::default();
        config.default_service_hours = ServiceHours {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_rule_defaults() {
        let yaml = r#"
provinces:
  Xinjiang:
    max_requests: 50
    window_secs: 60
    risk: high
"#;
        let mut config: GeoConfig = serde_yaml::from_str(yaml).unwrap();
        config.normalize();
        let rule = config.province_rule("XINJIANG");
        assert_eq!(rule.risk, RiskLevel::High);
        assert_eq!(rule.active_start_hour, 9);
        assert_eq!(rule.business_multiplier, 1.5);
        assert!(config.validate().is_ok());
    }
}
