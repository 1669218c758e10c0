//! Client identity parsing and tier inference.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;

use crate::error::{RampartError, Result};

/// Where a client key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// Anonymous traffic keyed by source address
    Ip,
    /// Authenticated user
    User,
    /// API key holder
    Api,
    /// A key that did not follow the `kind:id` convention
    Unverified,
}

impl IdentityKind {
    fn prefix(&self) -> &'static str {
        match self {
            IdentityKind::Ip => "ip",
            IdentityKind::User => "user",
            IdentityKind::Api => "api",
            IdentityKind::Unverified => "unverified",
        }
    }
}

/// Service tier used by the analysis limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientTier {
    Default,
    Premium,
    Admin,
    System,
}

impl ClientTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientTier::Default => "default",
            ClientTier::Premium => "premium",
            ClientTier::Admin => "admin",
            ClientTier::System => "system",
        }
    }
}

/// A namespaced client key such as `ip:10.0.0.1`, `user:42` or `api:abc`.
///
/// The canonical string form is the sharding key used by every limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    kind: IdentityKind,
    id: String,
}

impl ClientIdentity {
    /// Parse a client key, rejecting anything malformed.
    pub fn parse(raw: &str) -> Result<Self> {
        let (prefix, id) = raw
            .split_once(':')
            .ok_or_else(|| RampartError::InvalidIdentity(raw.to_string()))?;

        if id.is_empty() {
            return Err(RampartError::InvalidIdentity(raw.to_string()));
        }

        let kind = match prefix {
            "ip" => {
                id.parse::<IpAddr>()
                    .map_err(|_| RampartError::InvalidIdentity(raw.to_string()))?;
                IdentityKind::Ip
            }
            "user" => IdentityKind::User,
            "api" => IdentityKind::Api,
            _ => return Err(RampartError::InvalidIdentity(raw.to_string())),
        };

        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }

    /// Parse a client key, downgrading malformed keys to an unverified
    /// identity that gets the most restrictive treatment.
    pub fn parse_lenient(raw: &str) -> Self {
        match Self::parse(raw) {
            Ok(identity) => identity,
            Err(err) => {
                debug!(error = %err, "Treating client as unverified");
                Self {
                    kind: IdentityKind::Unverified,
                    id: raw.to_string(),
                }
            }
        }
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self {
            kind: IdentityKind::Ip,
            id: addr.to_string(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::User,
            id: id.into(),
        }
    }

    pub fn api(id: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Api,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the client is authenticated (user or API key).
    pub fn is_authenticated(&self) -> bool {
        matches!(self.kind, IdentityKind::User | IdentityKind::Api)
    }

    /// Infer the service tier from the identity namespace.
    pub fn tier(&self) -> ClientTier {
        match self.kind {
            IdentityKind::Api if self.id.starts_with("system") => ClientTier::System,
            IdentityKind::Api => ClientTier::Premium,
            IdentityKind::User if self.id.starts_with("admin") => ClientTier::Admin,
            _ => ClientTier::Default,
        }
    }

    /// The canonical `kind:id` form.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.prefix(), self.id)
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.id)
    }
}
