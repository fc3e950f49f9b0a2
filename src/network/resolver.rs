//! Domain resolution for the firewall allow-set
//!
//! Domains are resolved once, at activation. Wildcard patterns cannot be
//! resolved and are skipped; a domain that fails to resolve is logged and
//! dropped, so the allow-set degrades instead of the session failing.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use tracing::{debug, info, warn};

use crate::error::{LockdownError, Result};

/// Name lookup seam; the system resolver in production, a table in tests.
pub trait HostLookup: Send + Sync {
    fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

impl<T: HostLookup + ?Sized> HostLookup for std::sync::Arc<T> {
    fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
        (**self).lookup(domain)
    }
}

/// Uses the platform resolver (`getaddrinfo`).
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let addrs = (domain, 0u16)
            .to_socket_addrs()
            .map_err(|e| LockdownError::Resolution {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Addresses the allowlist chains will admit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddrs {
    pub v4: BTreeSet<Ipv4Addr>,
    pub v6: BTreeSet<Ipv6Addr>,
}

impl ResolvedAddrs {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn insert(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                self.v4.insert(v4);
            }
            IpAddr::V6(v6) => {
                self.v6.insert(v6);
            }
        }
    }
}

pub struct DomainResolver<L: HostLookup> {
    lookup: L,
}

impl<L: HostLookup> DomainResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Resolve every exact domain; wildcards and failures are skipped.
    pub fn resolve(&self, domains: &[String]) -> ResolvedAddrs {
        let mut resolved = ResolvedAddrs::default();
        for domain in domains {
            let domain = domain.trim();
            if domain.is_empty() {
                continue;
            }
            if domain.contains('*') {
                debug!(domain = domain, "skipping wildcard pattern");
                continue;
            }
            match self.lookup.lookup(domain) {
                Ok(ips) => {
                    debug!(domain = domain, count = ips.len(), "resolved");
                    for ip in ips {
                        resolved.insert(ip);
                    }
                }
                Err(e) => warn!(domain = domain, error = %e, "resolution failed, domain dropped"),
            }
        }
        info!(v4 = resolved.v4.len(), v6 = resolved.v6.len(), "allowed addresses resolved");
        resolved
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Fixed name table for tests.
    pub struct StaticLookup(pub HashMap<String, Vec<IpAddr>>);

    impl HostLookup for StaticLookup {
        fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
            self.0.get(domain).cloned().ok_or_else(|| LockdownError::Resolution {
                domain: domain.to_string(),
                reason: "NXDOMAIN".into(),
            })
        }
    }

    fn table() -> StaticLookup {
        let mut map = HashMap::new();
        map.insert(
            "codeforces.com".to_string(),
            vec!["213.248.110.126".parse().unwrap(), "2a00:1450::1".parse().unwrap()],
        );
        map.insert("judge.example".to_string(), vec!["10.0.0.5".parse().unwrap()]);
        StaticLookup(map)
    }

    #[test]
    fn test_wildcards_skipped() {
        let resolver = DomainResolver::new(table());
        let out = resolver.resolve(&["*.codeforces.com".to_string()]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_partial_failure_keeps_others() {
        let resolver = DomainResolver::new(table());
        let out = resolver.resolve(&[
            "codeforces.com".to_string(),
            "missing.example".to_string(),
            "judge.example".to_string(),
        ]);
        assert_eq!(out.v4.len(), 2);
        assert_eq!(out.v6.len(), 1);
        assert!(out.v4.contains(&"10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_duplicates_collapse() {
        let resolver = DomainResolver::new(table());
        let out = resolver.resolve(&["codeforces.com".to_string(), "codeforces.com".to_string()]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_system_lookup_localhost() {
        let ips = SystemLookup.lookup("localhost").unwrap();
        assert!(ips.iter().any(|ip| ip.is_loopback()));
    }
}
