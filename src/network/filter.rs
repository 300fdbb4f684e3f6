//! Hostname patterns and address ranges used by network filters.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::FilterMode;
use crate::error::ConfigError;

/// How a [`HostPattern`] matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// `*.example.com`: strict subdomains only.
    Wildcard,
    /// `example.com`: the name itself and every subdomain.
    Domain,
}

/// A validated hostname pattern. Stored lowercase without a trailing dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostPattern {
    kind: PatternKind,
    name: String,
}

impl HostPattern {
    /// Parse and validate a pattern.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidHostPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if trimmed.is_empty() {
            return Err(invalid("pattern cannot be empty"));
        }
        if trimmed == "*" {
            return Err(invalid("wildcard-only patterns are not allowed"));
        }
        if trimmed.contains(':') {
            return Err(invalid("patterns cannot include port numbers"));
        }

        let (kind, name) = match trimmed.strip_prefix("*.") {
            Some(base) => {
                if !base.contains('.') {
                    return Err(invalid("pattern is too broad (matches an entire TLD)"));
                }
                (PatternKind::Wildcard, base.to_string())
            }
            None => (PatternKind::Domain, trimmed),
        };

        if name.len() > 253 {
            return Err(invalid("name is longer than 253 characters"));
        }
        for label in name.split('.') {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.len() > 63 {
                return Err(invalid("label is longer than 63 characters"));
            }
            if let Some(ch) = label
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
            {
                return Err(invalid(&format!("invalid character '{}'", ch)));
            }
        }

        Ok(Self { kind, name })
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// The domain part, without any `*.` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Case-insensitive match of a queried name. A trailing dot is ignored.
    pub fn matches(&self, hostname: &str) -> bool {
        let host = hostname.trim_end_matches('.').to_ascii_lowercase();
        let is_subdomain = host.len() > self.name.len()
            && host.ends_with(&self.name)
            && host.as_bytes()[host.len() - self.name.len() - 1] == b'.';
        match self.kind {
            PatternKind::Wildcard => is_subdomain,
            PatternKind::Domain => is_subdomain || host == self.name,
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PatternKind::Wildcard => write!(f, "*.{}", self.name),
            PatternKind::Domain => f.write_str(&self.name),
        }
    }
}

impl FromStr for HostPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HostPattern {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HostPattern> for String {
    fn from(pattern: HostPattern) -> Self {
        pattern.to_string()
    }
}

/// An IPv4 or IPv6 network. A bare address is a host route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    /// Network containing exactly one address.
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Whether `ip` is inside this network.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_v4(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_v6(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for IpCidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidCidr {
            cidr: s.to_string(),
            reason: reason.to_string(),
        };

        let (addr_part, prefix_part) = match s.trim().split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s.trim(), None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| invalid("not an IP address"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p.parse::<u8>().map_err(|_| invalid("invalid prefix length"))?,
            None => max,
        };
        if prefix > max {
            return Err(invalid("prefix length out of range"));
        }

        // Store the network address so equal networks print identically.
        let addr = match addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_v4(prefix))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_v6(prefix))),
        };
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl TryFrom<String> for IpCidr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpCidr> for String {
    fn from(cidr: IpCidr) -> Self {
        cidr.to_string()
    }
}

/// Verdict for a queried hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDecision {
    /// Resolve upstream and relay the answer.
    Forward,
    /// Answer NXDOMAIN.
    Block,
}

/// Hostname policy applied by the DNS proxy.
#[derive(Debug, Clone)]
pub struct HostFilter {
    mode: FilterMode,
    patterns: Vec<HostPattern>,
}

impl HostFilter {
    pub fn new(mode: FilterMode, patterns: Vec<HostPattern>) -> Self {
        Self { mode, patterns }
    }

    /// Decide what to do with a query for `hostname`.
    pub fn check(&self, hostname: &str) -> HostDecision {
        let listed = self.patterns.iter().any(|p| p.matches(hostname));
        match (self.mode, listed) {
            (FilterMode::Whitelist, true) | (FilterMode::Blacklist, false) => HostDecision::Forward,
            _ => HostDecision::Block,
        }
    }
}
