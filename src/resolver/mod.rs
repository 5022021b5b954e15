//! Hostname resolution
//!
//! [`CachingResolver`] is the single place where hostnames become dialable
//! addresses. It fronts the system resolver with a bounded, time-expiring
//! cache and never fails: an unusable lookup collapses into the
//! [`UNRESOLVED`] sentinel so callers can treat it as a retryable miss.
//!
//! [`dns_tcp`] carries the alternate DNS-over-TCP path used when system
//! resolution is untrusted or blocked.

pub mod dns_tcp;

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::time::timeout;
use tracing::{debug, error};

/// Sentinel returned when a hostname could not be resolved
pub const UNRESOLVED: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Resolver cache bounds
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum number of cached hostname -> address list entries
    pub capacity: u64,
    /// Maximum number of cached hostname -> single address entries
    pub single_capacity: u64,
    /// Lifetime of a cached entry
    pub ttl: Duration,
    /// Upper bound on a single system lookup
    pub lookup_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            single_capacity: 1024,
            ttl: Duration::from_secs(90),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

/// Caching front for the system resolver
pub struct CachingResolver {
    addresses: Cache<String, Arc<Vec<IpAddr>>>,
    single: Cache<String, IpAddr>,
    lookup_timeout: Duration,
}

impl CachingResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            addresses: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.ttl)
                .build(),
            single: Cache::builder()
                .max_capacity(config.single_capacity)
                .time_to_live(config.ttl)
                .build(),
            lookup_timeout: config.lookup_timeout,
        }
    }

    /// Resolve a hostname to an ordered, non-empty address list.
    ///
    /// On lookup failure the list is `[UNRESOLVED]`; failures are logged and
    /// not cached, so the next call retries the lookup.
    pub async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        let host = strip_brackets(host);

        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }

        if let Some(cached) = self.addresses.get(host).await {
            return cached.as_ref().clone();
        }

        match bounded(self.lookup_timeout, lookup(host)).await {
            Ok(addrs) if !addrs.is_empty() => {
                debug!("Resolved {} to {:?}", host, addrs);
                self.addresses
                    .insert(host.to_string(), Arc::new(addrs.clone()))
                    .await;
                addrs
            }
            Ok(_) => {
                error!("Resolving {} returned no addresses", host);
                vec![UNRESOLVED]
            }
            Err(e) => {
                error!("Resolving {} failed: {}", host, e);
                vec![UNRESOLVED]
            }
        }
    }

    /// Store addresses obtained outside the system resolver for `host`.
    ///
    /// Later [`resolve`](Self::resolve) calls within the TTL return them
    /// without a new lookup. Empty lists and the sentinel are ignored.
    pub async fn remember(&self, host: &str, addrs: Vec<IpAddr>) {
        if addrs.is_empty() || is_unresolved(&addrs) {
            return;
        }
        let host = strip_brackets(host);
        self.single.invalidate(host).await;
        self.addresses.insert(host.to_string(), Arc::new(addrs)).await;
    }

    /// Resolve a hostname (or address literal) to one concrete address.
    ///
    /// Literals are returned as-is; otherwise the first result of
    /// [`resolve`](Self::resolve) is used, which may be [`UNRESOLVED`].
    pub async fn resolve_single(&self, host: &str) -> IpAddr {
        let host = strip_brackets(host);

        if let Ok(ip) = host.parse::<IpAddr>() {
            return ip;
        }

        if let Some(ip) = self.single.get(host).await {
            return ip;
        }

        let ip = self
            .resolve(host)
            .await
            .first()
            .copied()
            .unwrap_or(UNRESOLVED);

        if ip != UNRESOLVED {
            self.single.insert(host.to_string(), ip).await;
        }
        ip
    }
}

impl Default for CachingResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

/// True when `addrs` is the resolution-failure sentinel
pub fn is_unresolved(addrs: &[IpAddr]) -> bool {
    matches!(addrs, [ip] if *ip == UNRESOLVED)
}

async fn bounded<F>(limit: Duration, lookup: F) -> io::Result<Vec<IpAddr>>
where
    F: Future<Output = io::Result<Vec<IpAddr>>>,
{
    match timeout(limit, lookup).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("lookup timed out after {:?}", limit),
        )),
    }
}

async fn lookup(host: &str) -> io::Result<Vec<IpAddr>> {
    let mut addrs: Vec<IpAddr> = Vec::new();
    for addr in tokio::net::lookup_host((host, 0)).await? {
        let ip = addr.ip();
        if !addrs.contains(&ip) {
            addrs.push(ip);
        }
    }
    Ok(addrs)
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[tokio::test]
    async fn resolve_returns_literals_unchanged() {
        let resolver = CachingResolver::default();

        assert_eq!(
            resolver.resolve("127.0.0.1").await,
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
        assert_eq!(
            resolver.resolve("[::1]").await,
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]
        );
    }

    #[tokio::test]
    async fn resolve_failure_yields_sentinel() {
        let resolver = CachingResolver::default();

        let addrs = resolver.resolve("does-not-exist.invalid").await;
        assert!(is_unresolved(&addrs));
        assert_eq!(
            resolver.resolve_single("does-not-exist.invalid").await,
            UNRESOLVED
        );
    }

    #[tokio::test]
    async fn resolve_localhost_is_cached() {
        let resolver = CachingResolver::default();

        let first = resolver.resolve("localhost").await;
        assert!(!first.is_empty());
        assert!(!is_unresolved(&first));
        assert!(first.iter().all(|ip| ip.is_loopback()));

        let second = resolver.resolve("localhost").await;
        assert_eq!(first, second);
        assert!(resolver.resolve_single("localhost").await.is_loopback());
    }

    #[tokio::test]
    async fn remembered_addresses_are_served_from_cache() {
        let resolver = CachingResolver::default();
        let addrs = vec![
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8)),
        ];

        resolver.remember("blocked.invalid", addrs.clone()).await;

        assert_eq!(resolver.resolve("blocked.invalid").await, addrs);
        assert_eq!(resolver.resolve_single("blocked.invalid").await, addrs[0]);
    }

    #[tokio::test]
    async fn remember_ignores_sentinel() {
        let resolver = CachingResolver::default();

        resolver.remember("blocked.invalid", vec![UNRESOLVED]).await;
        resolver.remember("blocked.invalid", Vec::new()).await;

        assert!(is_unresolved(&resolver.resolve("blocked.invalid").await));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_lookup_is_cut_off() {
        let stalled = std::future::pending::<io::Result<Vec<IpAddr>>>();

        let err = bounded(Duration::from_secs(5), stalled).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let quick = async { Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]) };
        assert_eq!(
            bounded(Duration::from_secs(5), quick).await.unwrap(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
    }

    #[test]
    fn is_unresolved_only_matches_sentinel_alone() {
        assert!(is_unresolved(&[UNRESOLVED]));
        assert!(!is_unresolved(&[]));
        assert!(!is_unresolved(&[UNRESOLVED, IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        assert!(!is_unresolved(&[IpAddr::V4(Ipv4Addr::LOCALHOST)]));
    }
}
