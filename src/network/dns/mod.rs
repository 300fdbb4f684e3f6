//! DNS filtering proxy.

pub mod packet;
pub mod proxy;

use std::net::IpAddr;
use std::path::Path;

use crate::error::SandboxError;

pub use proxy::{DnsProxy, ProxyHandle, ProxyStats, UPSTREAM_TIMEOUT};

/// Resolver files checked for an upstream, in order. The second is where
/// systemd-resolved keeps the real servers behind its 127.0.0.53 stub.
pub const RESOLV_CONF_CANDIDATES: &[&str] =
    &["/etc/resolv.conf", "/run/systemd/resolve/resolv.conf"];

/// Contents of the resolver file mounted into filtered sandboxes.
pub const PROXY_RESOLV_CONF: &str = "# DNS is filtered by nsbox\nnameserver 127.0.0.1\n";

/// Nameserver addresses listed in resolv.conf text. Lines that do not parse
/// as an IP address are skipped.
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => addr.split('%').next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

/// Pick the resolver the proxy forwards to: the first non-loopback
/// nameserver of the host. Loopback resolvers are unreachable from inside
/// the namespace.
pub fn host_upstream() -> Result<IpAddr, SandboxError> {
    upstream_from(RESOLV_CONF_CANDIDATES.iter().map(Path::new))
}

fn upstream_from<'a>(files: impl Iterator<Item = &'a Path>) -> Result<IpAddr, SandboxError> {
    for file in files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        if let Some(ip) = parse_nameservers(&content)
            .into_iter()
            .find(|ip| !ip.is_loopback())
        {
            tracing::debug!("Using upstream resolver {} from {}", ip, file.display());
            return Ok(ip);
        }
    }
    Err(SandboxError::NameResolution {
        host: "upstream resolver".to_string(),
        reason: "no usable nameserver in the host resolver configuration; set network.upstreamDns"
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nameservers() {
        let content = "# comment\nsearch lan\nnameserver 127.0.0.53\nnameserver 1.1.1.1\nnameserver fe80::1%eth0\nnameserver bogus\n";
        let servers = parse_nameservers(content);
        assert_eq!(
            servers,
            vec![
                "127.0.0.53".parse::<IpAddr>().unwrap(),
                "1.1.1.1".parse().unwrap(),
                "fe80::1".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_upstream_skips_loopback_stub() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("stub");
        let real = dir.path().join("real");
        std::fs::write(&stub, "nameserver 127.0.0.53\n").unwrap();
        std::fs::write(&real, "nameserver 9.9.9.9\n").unwrap();

        let ip = upstream_from([stub.as_path(), real.as_path()].into_iter()).unwrap();
        assert_eq!(ip, "9.9.9.9".parse::<IpAddr>().unwrap());

        assert!(matches!(
            upstream_from([stub.as_path()].into_iter()),
            Err(SandboxError::NameResolution { .. })
        ));
    }
}
