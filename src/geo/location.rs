//! Client locations and the resolver seam.

use async_trait::async_trait;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{RampartError, Result};

/// Where a request comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO 3166 alpha-2 code
    pub country_code: String,
    pub province: String,
    #[serde(default)]
    pub city: Option<String>,
    pub timezone: Tz,
    #[serde(default)]
    pub is_vpn: bool,
    #[serde(default)]
    pub is_proxy: bool,
}

impl GeoLocation {
    pub fn new(country_code: impl Into<String>, province: impl Into<String>, timezone: Tz) -> Self {
        Self {
            country_code: country_code.into(),
            province: province.into(),
            city: None,
            timezone,
            is_vpn: false,
            is_proxy: false,
        }
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_vpn(mut self, is_vpn: bool) -> Self {
        self.is_vpn = is_vpn;
        self
    }

    pub fn with_proxy(mut self, is_proxy: bool) -> Self {
        self.is_proxy = is_proxy;
        self
    }

    pub fn is_domestic(&self, home_country: &str) -> bool {
        self.country_code.eq_ignore_ascii_case(home_country)
    }
}

/// Maps an address to a location.
///
/// Implementations back onto whatever geolocation database the deployment
/// has. An error means "unknown" and the geographic check fails open.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoLocation>;

    /// Short resolver name for diagnostics.
    fn name(&self) -> &'static str;
}

/// An address block in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

impl IpRange {
    pub fn new(network: IpAddr, prefix: u8) -> Result<Self> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(RampartError::Config(format!(
                "prefix /{} too long for {}",
                prefix, network
            )));
        }
        Ok(Self { network, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpRange {
    type Err = RampartError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RampartError::Config(format!("invalid address range '{}'", s));
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix = match prefix {
            Some(p) => p.trim().parse().map_err(|_| invalid())?,
            None if network.is_ipv4() => 32,
            None => 128,
        };
        Self::new(network, prefix)
    }
}

impl TryFrom<String> for IpRange {
    type Error = RampartError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<IpRange> for String {
    fn from(range: IpRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// A configured address block and its location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticLocation {
    pub range: IpRange,
    pub location: GeoLocation,
}

/// Resolver over a fixed table of address ranges.
///
/// The most specific matching range wins. Addresses outside every range get
/// the fallback location, or an error when there is none.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoResolver {
    ranges: Vec<StaticLocation>,
    fallback: Option<GeoLocation>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<StaticLocation>, fallback: Option<GeoLocation>) -> Self {
        let mut resolver = Self {
            ranges: entries,
            fallback,
        };
        resolver.sort();
        resolver
    }

    pub fn with_range(mut self, range: IpRange, location: GeoLocation) -> Self {
        self.ranges.push(StaticLocation { range, location });
        self.sort();
        self
    }

    pub fn with_fallback(mut self, location: GeoLocation) -> Self {
        self.fallback = Some(location);
        self
    }

    fn sort(&mut self) {
        self.ranges
            .sort_by(|a, b| b.range.prefix().cmp(&a.range.prefix()));
    }

    fn lookup(&self, ip: IpAddr) -> Option<&GeoLocation> {
        self.ranges
            .iter()
            .find(|entry| entry.range.contains(ip))
            .map(|entry| &entry.location)
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoLocation> {
        self.lookup(ip)
            .cloned()
            .ok_or_else(|| RampartError::GeoLookup(format!("no location for {}", ip)))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
