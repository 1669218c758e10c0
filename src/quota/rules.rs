//! Quota limit definitions and request path matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::LimitRule;
use crate::decision::RequestCategory;
use crate::error::{RampartError, Result};

/// Limits for the sensitive request categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryLimits {
    #[serde(default = "default_auth")]
    pub auth: LimitRule,
    #[serde(default = "default_api")]
    pub api: LimitRule,
    #[serde(default = "default_upload")]
    pub upload: LimitRule,
    #[serde(default = "default_admin")]
    pub admin: LimitRule,
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            auth: default_auth(),
            api: default_api(),
            upload: default_upload(),
            admin: default_admin(),
        }
    }
}

fn default_auth() -> LimitRule {
    LimitRule::new(5, 300)
}

fn default_api() -> LimitRule {
    LimitRule::new(1000, 3600)
}

fn default_upload() -> LimitRule {
    LimitRule::new(10, 3600)
}

fn default_admin() -> LimitRule {
    LimitRule::new(100, 3600)
}

impl CategoryLimits {
    /// The rule for a category, if it is one the quota limiter guards.
    pub fn get(&self, category: RequestCategory) -> Option<LimitRule> {
        match category {
            RequestCategory::Auth => Some(self.auth),
            RequestCategory::Api => Some(self.api),
            RequestCategory::Upload => Some(self.upload),
            RequestCategory::Admin => Some(self.admin),
            _ => None,
        }
    }
}

/// Quota limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Budget shared by all traffic
    #[serde(default = "default_global")]
    pub global: LimitRule,

    /// Per-client budget for anonymous (IP) clients
    #[serde(default = "default_per_ip")]
    pub per_ip: LimitRule,

    /// Per-client budget for authenticated clients
    #[serde(default = "default_per_user")]
    pub per_user: LimitRule,

    /// Short-window budget against spikes
    #[serde(default = "default_burst")]
    pub burst: LimitRule,

    /// Budget for any endpoint without an explicit rule
    #[serde(default = "default_endpoint")]
    pub default_endpoint: LimitRule,

    /// Explicit endpoint budgets keyed `"METHOD /path"` or `"* /path"`
    #[serde(default)]
    pub endpoints: HashMap<String, LimitRule>,

    #[serde(default)]
    pub categories: CategoryLimits,

    /// Path prefixes that bypass the limiter
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Client keys that bypass the limiter
    #[serde(default)]
    pub trusted_clients: Vec<String>,

    /// How long a quota violation counts toward category penalties
    #[serde(default = "default_violation_retention")]
    pub violation_retention_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            global: default_global(),
            per_ip: default_per_ip(),
            per_user: default_per_user(),
            burst: default_burst(),
            default_endpoint: default_endpoint(),
            endpoints: HashMap::new(),
            categories: CategoryLimits::default(),
            exempt_paths: default_exempt_paths(),
            trusted_clients: Vec::new(),
            violation_retention_secs: default_violation_retention(),
        }
    }
}

fn default_global() -> LimitRule {
    LimitRule::new(10_000, 60)
}

fn default_per_ip() -> LimitRule {
    LimitRule::new(100, 60)
}

fn default_per_user() -> LimitRule {
    LimitRule::new(1000, 60)
}

fn default_burst() -> LimitRule {
    LimitRule::new(20, 1)
}

fn default_endpoint() -> LimitRule {
    LimitRule::new(60, 60)
}

fn default_exempt_paths() -> Vec<String> {
    ["/health", "/healthz", "/ready", "/metrics", "/static/", "/favicon.ico"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_violation_retention() -> u64 {
    3600
}

/// File extensions served as static assets.
const ASSET_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2", ".map",
];

impl QuotaConfig {
    pub fn normalize(&mut self) {
        self.endpoints = self
            .endpoints
            .drain()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
    }

    pub fn validate(&self) -> Result<()> {
        self.global.validate("quota.global")?;
        self.per_ip.validate("quota.per_ip")?;
        self.per_user.validate("quota.per_user")?;
        self.burst.validate("quota.burst")?;
        self.default_endpoint.validate("quota.default_endpoint")?;
        self.categories.auth.validate("quota.categories.auth")?;
        self.categories.api.validate("quota.categories.api")?;
        self.categories.upload.validate("quota.categories.upload")?;
        self.categories.admin.validate("quota.categories.admin")?;

        for (endpoint, rule) in &self.endpoints {
            if endpoint.split_once(' ').is_none() {
                return Err(RampartError::Config(format!(
                    "quota.endpoints: '{}' must be of the form 'METHOD /path'",
                    endpoint
                )));
            }
            rule.validate(&format!("quota.endpoints.{}", endpoint))?;
        }

        if self.violation_retention_secs == 0 {
            return Err(RampartError::Config(
                "quota.violation_retention_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Find the budget for an endpoint.
    ///
    /// An exact `METHOD /path` rule wins over a `* /path` rule, which wins over
    /// the default.
    pub fn endpoint_limit(&self, method: &str, path: &str) -> LimitRule {
        let path = normalize_path(path).to_ascii_lowercase();
        let method = method.to_ascii_lowercase();

        self.endpoints
            .get(&format!("{} {}", method, path))
            .or_else(|| self.endpoints.get(&format!("* {}", path)))
            .copied()
            .unwrap_or(self.default_endpoint)
    }

    /// Whether a path is exempt from quota checks.
    pub fn is_exempt(&self, path: &str) -> bool {
        let path = normalize_path(path).to_ascii_lowercase();
        self.exempt_paths
            .iter()
            .any(|prefix| path == *prefix || path.starts_with(prefix.as_str()))
            || ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    pub fn is_trusted(&self, client_key: &str) -> bool {
        self.trusted_clients.iter().any(|c| c == client_key)
    }
}

/// Strip the query string and any trailing slash.
pub fn normalize_path(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// The route a path belongs to, with identifier segments collapsed to
/// `:id` so `/api/properties/17` and `/api/properties/18` are one route.
pub fn route_pattern(path: &str) -> String {
    normalize_path(path)
        .split('/')
        .map(|segment| if is_identifier(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

/// Numeric ids, UUIDs and long hex tokens.
fn is_identifier(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    bytes.iter().all(u8::is_ascii_digit)
        || (bytes.len() == 36 && bytes.iter().all(|b| b.is_ascii_hexdigit() || *b == b'-'))
        || (bytes.len() >= 16 && bytes.iter().all(u8::is_ascii_hexdigit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/search?q=1"), "/api/search");
        assert_eq!(normalize_path("/api/search/"), "/api/search");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_route_pattern_collapses_ids() {
        assert_eq!(route_pattern("/api/properties/17"), "/api/properties/:id");
        assert_eq!(route_pattern("/api/properties/18/photos/"), "/api/properties/:id/photos");
        assert_eq!(
            route_pattern("/api/listings/3f2b8c1e-9a4d-4e6f-8b1a-2c3d4e5f6a7b?full=1"),
            "/api/listings/:id"
        );
        assert_eq!(route_pattern("/api/exports/deadbeefcafebabe"), "/api/exports/:id");
        assert_eq!(route_pattern("/api/v2/search"), "/api/v2/search");
        assert_eq!(route_pattern("/"), "/");
    }

    #[test]
    fn test_endpoint_limit_precedence() {
        let mut config = QuotaConfig::default();
        config
            .endpoints
            .insert("get /api/properties".into(), LimitRule::new(50, 60));
        config
            .endpoints
            .insert("* /api/properties".into(), LimitRule::new(80, 60));

        assert_eq!(config.endpoint_limit("GET", "/api/properties?page=2"), LimitRule::new(50, 60));
        assert_eq!(config.endpoint_limit("POST", "/api/properties"), LimitRule::new(80, 60));
        assert_eq!(config.endpoint_limit("GET", "/api/agents"), config.default_endpoint);
    }

    #[test]
    fn test_exempt_paths() {
        let config = QuotaConfig::default();
        assert!(config.is_exempt("/health"));
        assert!(config.is_exempt("/static/app.js"));
        assert!(config.is_exempt("/assets/logo.PNG"));
        assert!(!config.is_exempt("/api/properties"));
    }

    #[test]
    fn test_category_limits_only_for_sensitive() {
        let limits = CategoryLimits::default();
        assert_eq!(limits.get(RequestCategory::Auth), Some(LimitRule::new(5, 300)));
        assert_eq!(limits.get(RequestCategory::Search), None);
    }

    #[test]
    fn test_bad_endpoint_key_rejected() {
        let mut config = QuotaConfig::default();
        config.endpoints.insert("/no-method".into(), LimitRule::new(1, 1));
        assert!(config.validate().is_err());
    }
}
