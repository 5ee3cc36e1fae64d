//! Destination allow-listing.
//!
//! The security boundary of the proxy: a CONNECT target is dialed only if it
//! matches the allow-list. Three kinds of entries are supported — exact
//! hostnames (which also admit strict subdomains), and CIDR blocks for IP
//! literals. Wildcard prefix patterns are not supported. The set is built
//! once at startup and shared read-only.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An IP network expressed as base address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `a.b.c.d/len` or `v6/len`. Returns `None` on any malformed input.
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let addr: IpAddr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return None;
        }
        Some(Self { addr, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                v4_prefix(net, self.prefix) == v4_prefix(ip, self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                v6_prefix(net, self.prefix) == v6_prefix(ip, self.prefix)
            }
            _ => false,
        }
    }
}

fn v4_prefix(addr: Ipv4Addr, prefix: u8) -> u32 {
    let bits = u32::from(addr);
    if prefix == 0 {
        0
    } else {
        bits & (u32::MAX << (32 - prefix))
    }
}

fn v6_prefix(addr: Ipv6Addr, prefix: u8) -> u128 {
    let bits = u128::from(addr);
    if prefix == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - prefix))
    }
}

/// Immutable set of permitted destinations.
pub struct AllowSet {
    hostnames: HashSet<String>,
    networks: Vec<Cidr>,
}

impl AllowSet {
    /// Build from raw allow-list entries. Entries containing `/` are parsed
    /// as CIDR blocks; everything else is an exact hostname. Malformed CIDR
    /// entries are dropped (and therefore denied) rather than guessed at.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hostnames = HashSet::new();
        let mut networks = Vec::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry.contains('/') {
                match Cidr::parse(entry) {
                    Some(cidr) => networks.push(cidr),
                    None => tracing::warn!("Dropping malformed CIDR entry: {}", entry),
                }
            } else {
                hostnames.insert(entry.to_ascii_lowercase());
            }
        }

        Self { hostnames, networks }
    }

    /// Decide whether a requested destination is permitted.
    ///
    /// All three checks run; any match accepts: exact hostname, strict
    /// subdomain of a listed hostname, or IP literal inside a listed block.
    pub fn permits(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();

        if self.hostnames.contains(&host) {
            return true;
        }

        if self
            .hostnames
            .iter()
            .any(|domain| host.ends_with(&format!(".{domain}")))
        {
            return true;
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if self.networks.iter().any(|net| net.contains(ip)) {
                return true;
            }
        }

        false
    }

    /// Number of hostname entries.
    pub fn hostname_count(&self) -> usize {
        self.hostnames.len()
    }

    /// Number of CIDR entries.
    pub fn network_count(&self) -> usize {
        self.networks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DESTINATIONS;

    fn default_set() -> AllowSet {
        AllowSet::new(DEFAULT_DESTINATIONS.iter().copied())
    }

    #[test]
    fn test_exact_hostname() {
        let set = default_set();
        assert!(set.permits("api.telegram.org"));
        assert!(set.permits("API.Telegram.ORG"));
        assert!(set.permits("updates.tdesktop.com"));
    }

    #[test]
    fn test_subdomain_suffix() {
        let set = default_set();
        assert!(set.permits("cdn1.api.telegram.org"));
        // "telegram.org" itself is not listed; only its listed subdomains are
        assert!(!set.permits("telegram.org"));
    }

    #[test]
    fn test_rejects_unlisted() {
        let set = default_set();
        assert!(!set.permits("evil.example.com"));
        assert!(!set.permits("notapi.telegram.org.evil.com"));
        // no wildcard prefix matching
        assert!(!set.permits("telegram"));
    }

    #[test]
    fn test_cidr_match() {
        let set = default_set();
        assert!(set.permits("149.154.167.51")); // inside 149.154.160.0/20
        assert!(set.permits("91.108.56.130")); // inside 91.108.56.0/22
        assert!(!set.permits("8.8.8.8"));
        assert!(!set.permits("203.0.113.5"));
    }

    #[test]
    fn test_ipv6_cidr() {
        let set = AllowSet::new(["2001:db8::/32"]);
        assert!(set.permits("2001:db8::1"));
        assert!(!set.permits("2001:db9::1"));
        // v4 literal never matches a v6 block
        assert!(!set.permits("192.0.2.1"));
    }

    #[test]
    fn test_malformed_cidr_dropped() {
        let set = AllowSet::new(["10.0.0.0/99", "not-an-ip/8", "example.com"]);
        assert_eq!(set.network_count(), 0);
        assert!(!set.permits("10.0.0.1"));
        assert!(set.permits("example.com"));
    }

    #[test]
    fn test_zero_prefix_matches_everything() {
        let set = AllowSet::new(["0.0.0.0/0"]);
        assert!(set.permits("8.8.8.8"));
        assert!(set.permits("203.0.113.5"));
        assert!(!set.permits("a.domain.is.not.an.ip"));
    }
}
