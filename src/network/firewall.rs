//! Packet filter rules for the isolated namespace.
//!
//! Compilation is pure: hostnames are resolved beforehand by
//! [`resolve_hosts`] and passed in, so the same inputs always render the
//! same rule text.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{FilterMode, NetworkFilter};
use crate::error::SandboxError;
use crate::network::filter::{HostPattern, IpCidr, PatternKind};
use crate::utils::find_in_path;

/// Rule verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    fn target(self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        }
    }
}

/// One packet filter rule, independent of address family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rule {
    /// Outgoing loopback traffic.
    LoopbackOut,
    /// Incoming loopback traffic.
    LoopbackIn,
    /// UDP port 53 to the resolver the DNS proxy forwards to.
    DnsUpstream(IpAddr),
    /// Traffic to a listed network.
    Destination { cidr: IpCidr, verdict: Verdict },
    /// Everything not matched earlier.
    CatchAll(Verdict),
}

impl Rule {
    /// Arguments after the iptables program name.
    pub fn to_args(&self) -> Vec<String> {
        let args: Vec<String> = match self {
            Rule::LoopbackOut => vec!["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]
                .into_iter()
                .map(String::from)
                .collect(),
            Rule::LoopbackIn => vec!["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"]
                .into_iter()
                .map(String::from)
                .collect(),
            Rule::DnsUpstream(addr) => vec![
                "-A".to_string(),
                "OUTPUT".to_string(),
                "-p".to_string(),
                "udp".to_string(),
                "-d".to_string(),
                addr.to_string(),
                "--dport".to_string(),
                "53".to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ],
            Rule::Destination { cidr, verdict } => vec![
                "-A".to_string(),
                "OUTPUT".to_string(),
                "-d".to_string(),
                cidr.to_string(),
                "-j".to_string(),
                verdict.target().to_string(),
            ],
            Rule::CatchAll(verdict) => vec![
                "-A".to_string(),
                "OUTPUT".to_string(),
                "-j".to_string(),
                verdict.target().to_string(),
            ],
        };
        args
    }
}

/// Ordered IPv4 and IPv6 rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRuleSet {
    pub v4: Vec<Rule>,
    pub v6: Vec<Rule>,
}

impl CompiledRuleSet {
    /// Whether ip6tables is needed.
    pub fn needs_ipv6(&self) -> bool {
        !self.v6.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

impl fmt::Display for CompiledRuleSet {
    /// One `iptables ...` / `ip6tables ...` line per rule.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (program, rules) in [("iptables", &self.v4), ("ip6tables", &self.v6)] {
            for rule in rules {
                writeln!(f, "{} {}", program, rule.to_args().join(" "))?;
            }
        }
        Ok(())
    }
}

/// Addresses found for each exact hostname pattern before launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedHosts(BTreeMap<String, BTreeSet<IpAddr>>);

impl ResolvedHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: &str, addrs: impl IntoIterator<Item = IpAddr>) {
        self.0.entry(host.to_string()).or_default().extend(addrs);
    }

    /// Sorted addresses for a host, empty when not resolved.
    pub fn get(&self, host: &str) -> impl Iterator<Item = &IpAddr> {
        self.0.get(host).into_iter().flatten()
    }
}

/// Compile a filter into rules.
///
/// Order per family: loopback, the proxy's upstream resolver, one rule per
/// entry in insertion order (host patterns first, then CIDRs), and the
/// catch-all last.
pub fn compile(
    filter: &NetworkFilter,
    resolved: &ResolvedHosts,
    upstream: Option<IpAddr>,
) -> CompiledRuleSet {
    let (entry_verdict, fallback) = match filter.mode {
        FilterMode::Whitelist => (Verdict::Accept, Verdict::Drop),
        FilterMode::Blacklist => (Verdict::Drop, Verdict::Accept),
    };

    let mut entries: Vec<IpCidr> = Vec::new();
    for pattern in &filter.hosts {
        entries.extend(resolved.get(pattern.name()).map(|ip| IpCidr::host(*ip)));
    }
    entries.extend(filter.cidrs.iter().copied());

    let mut set = CompiledRuleSet::default();
    let has_v6 = entries.iter().any(IpCidr::is_ipv6) || upstream.is_some_and(|ip| ip.is_ipv6());
    let families = [
        (false, &mut set.v4, true),
        (true, &mut set.v6, has_v6 || filter.mode == FilterMode::Whitelist),
    ];

    for (v6, rules, enabled) in families {
        if !enabled {
            continue;
        }
        rules.push(Rule::LoopbackOut);
        rules.push(Rule::LoopbackIn);
        if let Some(addr) = upstream.filter(|a| a.is_ipv6() == v6) {
            rules.push(Rule::DnsUpstream(addr));
        }
        for cidr in entries.iter().filter(|c| c.is_ipv6() == v6) {
            rules.push(Rule::Destination {
                cidr: *cidr,
                verdict: entry_verdict,
            });
        }
        rules.push(Rule::CatchAll(fallback));
    }
    set
}

/// Resolve the exact hostname patterns of a filter.
///
/// Wildcards cannot be resolved ahead of time and are enforced by the DNS
/// proxy only. Any lookup failure stops the launch. Addresses can change
/// after this lookup (rotating CDN records); rules are never refreshed.
pub async fn resolve_hosts(filter: &NetworkFilter) -> Result<ResolvedHosts, SandboxError> {
    let mut resolved = ResolvedHosts::new();
    for pattern in filter.hosts.iter().filter(|p| p.kind() == PatternKind::Domain) {
        let addrs = lookup(pattern).await?;
        tracing::debug!("Resolved {} to {:?}", pattern, addrs);
        resolved.insert(pattern.name(), addrs);
    }
    Ok(resolved)
}

async fn lookup(pattern: &HostPattern) -> Result<Vec<IpAddr>, SandboxError> {
    let failure = |reason: String| SandboxError::NameResolution {
        host: pattern.name().to_string(),
        reason,
    };
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((pattern.name(), 0))
        .await
        .map_err(|e| failure(e.to_string()))?
        .map(|sock| sock.ip())
        .collect();
    if addrs.is_empty() {
        return Err(failure("no addresses returned".to_string()));
    }
    Ok(addrs)
}

/// Resolved iptables and ip6tables binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iptables {
    pub v4: PathBuf,
    pub v6: Option<PathBuf>,
    /// Multi-call binaries (xtables-nft-multi) take the applet name first.
    pub multicall: bool,
}

impl Iptables {
    /// Locate iptables on `$PATH`, following symlinks to detect multi-call binaries.
    pub fn detect() -> Result<Self, SandboxError> {
        let v4 = find_in_path("iptables")
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
            .ok_or_else(|| {
                SandboxError::missing("iptables", "install iptables or iptables-nft")
            })?;
        let v6 = find_in_path("ip6tables").map(|p| std::fs::canonicalize(&p).unwrap_or(p));
        let multicall = v4
            .file_name()
            .map(|n| n.to_string_lossy().contains("multi"))
            .unwrap_or(false);
        Ok(Self { v4, v6, multicall })
    }

    /// Fail when the rules need ip6tables and it is not installed.
    pub fn check_rules(&self, rules: &CompiledRuleSet) -> Result<(), SandboxError> {
        if rules.needs_ipv6() && self.v6.is_none() {
            return Err(SandboxError::missing(
                "ip6tables",
                "install ip6tables or remove IPv6 filter entries",
            ));
        }
        Ok(())
    }

    /// Full argv for each rule, IPv4 first.
    pub fn commands(&self, rules: &CompiledRuleSet) -> Result<Vec<Vec<String>>, SandboxError> {
        self.check_rules(rules)?;
        let mut commands = Vec::with_capacity(rules.v4.len() + rules.v6.len());
        let families = [
            (Some(&self.v4), "iptables", &rules.v4),
            (self.v6.as_ref(), "ip6tables", &rules.v6),
        ];
        for (program, applet, list) in families {
            let Some(program) = program else { continue };
            for rule in list {
                let mut argv = vec![program.display().to_string()];
                if self.multicall {
                    argv.push(applet.to_string());
                }
                argv.extend(rule.to_args());
                commands.push(argv);
            }
        }
        Ok(commands)
    }
}
