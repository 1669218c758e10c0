//! Admission decisions and request categories.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The rate-limit axis that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Global,
    Client,
    Burst,
    Endpoint,
    Category,
    Abuse,
    Concurrency,
    Complexity,
    AnalysisType,
    PayloadSize,
    Tier,
    Predictive,
    Region,
    City,
    Timezone,
    RegionalQuota,
    ServiceHours,
    GeoBlock,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::Client => "client",
            Dimension::Burst => "burst",
            Dimension::Endpoint => "endpoint",
            Dimension::Category => "category",
            Dimension::Abuse => "abuse",
            Dimension::Concurrency => "concurrency",
            Dimension::Complexity => "complexity",
            Dimension::AnalysisType => "analysis_type",
            Dimension::PayloadSize => "payload_size",
            Dimension::Tier => "tier",
            Dimension::Predictive => "predictive",
            Dimension::Region => "region",
            Dimension::City => "city",
            Dimension::Timezone => "timezone",
            Dimension::RegionalQuota => "regional_quota",
            Dimension::ServiceHours => "service_hours",
            Dimension::GeoBlock => "geo_block",
        }
    }
}

/// Coarse request category derived from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCategory {
    Auth,
    Api,
    Upload,
    Admin,
    Search,
    Analysis,
    Export,
    General,
}

impl RequestCategory {
    /// Classify a request path by its segments.
    ///
    /// Checks run from the most to the least sensitive category so that
    /// `/api/admin/...` is an admin request rather than a plain API one.
    pub fn from_path(path: &str) -> Self {
        let path = path
            .split(['?', '#'])
            .next()
            .unwrap_or(path)
            .to_ascii_lowercase();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let has = |words: &[&str]| {
            segments
                .iter()
                .any(|segment| words.iter().any(|word| segment_is(segment, word)))
        };

        if has(&["login", "logout", "auth", "register", "password", "token"]) {
            RequestCategory::Auth
        } else if has(&["admin"]) {
            RequestCategory::Admin
        } else if has(&["upload", "uploads", "import"]) {
            RequestCategory::Upload
        } else if has(&["analysis", "analytics"]) {
            RequestCategory::Analysis
        } else if has(&["export", "exports", "download", "downloads"]) {
            RequestCategory::Export
        } else if has(&["search"]) {
            RequestCategory::Search
        } else if segments.first() == Some(&"api") {
            RequestCategory::Api
        } else {
            RequestCategory::General
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCategory::Auth => "auth",
            RequestCategory::Api => "api",
            RequestCategory::Upload => "upload",
            RequestCategory::Admin => "admin",
            RequestCategory::Search => "search",
            RequestCategory::Analysis => "analysis",
            RequestCategory::Export => "export",
            RequestCategory::General => "general",
        }
    }
}

/// `word` itself, or `word` followed by a separator as in `password-reset`.
fn segment_is(segment: &str, word: &str) -> bool {
    match segment.strip_prefix(word) {
        Some("") => true,
        Some(rest) => rest.starts_with(['-', '_', '.']),
        None => false,
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_secs: u64,
    /// The axis that denied the request, if any
    pub dimension: Option<Dimension>,
    /// Diagnostic detail for the caller; never needed to act on the decision
    pub metadata: Map<String, Value>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            dimension: None,
            metadata: Map::new(),
        }
    }

    pub fn deny(dimension: Dimension, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: retry_after_secs.max(1),
            dimension: Some(dimension),
            metadata: Map::new(),
        }
    }

    /// Attach a diagnostic value.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Merge another decision's metadata into this one, keeping existing keys.
    pub fn absorb(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.metadata.entry(key).or_insert(value);
        }
    }
}

/// Seconds until the oldest event in a window expires, floored at 1.
pub fn retry_after(window: Duration, oldest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    let remaining = match oldest {
        Some(oldest) => window - (now - oldest),
        None => window,
    };
    let secs = (remaining.num_milliseconds() as f64 / 1000.0).ceil();
    if secs < 1.0 {
        1
    } else {
        secs as u64
    }
}
