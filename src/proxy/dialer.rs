//! TCP connection establishment with per-address failover
//!
//! The dialer turns a hostname into candidate addresses (through the
//! [`CachingResolver`], falling back to DNS over TCP when configured) and
//! tries them in order until one connects.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{Result, WaypointError};
use crate::resolver::dns_tcp;
use crate::resolver::{is_unresolved, CachingResolver, UNRESOLVED};

/// Default DNS server used for DNS-over-TCP lookups
pub const DEFAULT_DNS_SERVER: &str = "8.8.8.8:53";

/// Alternate resolution used when the system resolver gives nothing usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsFallback {
    /// DNS server as `host[:port]` (port defaults to 53)
    pub server: String,
    /// Optional HTTP proxy (`host:port`) to reach the DNS server through
    pub proxy: Option<String>,
    /// Optional proxy credentials
    pub credentials: Option<(String, String)>,
}

impl Default for DnsFallback {
    fn default() -> Self {
        Self {
            server: DEFAULT_DNS_SERVER.to_string(),
            proxy: None,
            credentials: None,
        }
    }
}

/// Establishes TCP connections to resolved endpoints
pub struct Dialer {
    resolver: Arc<CachingResolver>,
    fallback: Option<DnsFallback>,
}

impl Dialer {
    pub fn new(resolver: Arc<CachingResolver>) -> Self {
        Self {
            resolver,
            fallback: None,
        }
    }

    /// Enable DNS-over-TCP fallback for hostnames the system cannot resolve
    pub fn with_dns_fallback(mut self, fallback: DnsFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn resolver(&self) -> &Arc<CachingResolver> {
        &self.resolver
    }

    /// Candidate addresses for `host`, in dial order
    pub async fn candidates(&self, host: &str) -> Vec<IpAddr> {
        let addrs = self.resolver.resolve(host).await;
        if !is_unresolved(&addrs) {
            return addrs;
        }

        let Some(fallback) = &self.fallback else {
            return addrs;
        };

        let credentials = fallback
            .credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()));

        match self
            .resolve_via_tcp(host, &fallback.server, fallback.proxy.as_deref(), credentials)
            .await
        {
            Ok(list) => {
                debug!("Resolved {} over TCP to {:?}", host, list);
                self.resolver.remember(host, list.clone()).await;
                list
            }
            Err(e) => {
                warn!("DNS over TCP for {} failed: {}", host, e);
                addrs
            }
        }
    }

    /// Connect to `host:port`, trying every candidate address in order
    pub async fn dial(&self, host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
        let candidates = self.candidates(host).await;
        self.dial_with(host, port, connect_timeout, None, Some(candidates))
            .await
    }

    /// Connect to `host:port` using the system resolver only
    pub(crate) async fn dial_system(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<TcpStream> {
        let candidates = self.resolver.resolve(host).await;
        self.dial_with(host, port, connect_timeout, None, Some(candidates))
            .await
    }

    /// Connect to `host:port`.
    ///
    /// `candidates` overrides resolution when supplied. The first candidate
    /// that connects wins; if all fail the last error is returned, and an
    /// empty candidate list is reported as [`WaypointError::NoAddresses`].
    #[instrument(skip(self, candidates), fields(target = %format_authority(host, port)))]
    pub async fn dial_with(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        source_address: Option<SocketAddr>,
        candidates: Option<Vec<IpAddr>>,
    ) -> Result<TcpStream> {
        let candidates = match candidates {
            Some(list) => list,
            None => self.resolver.resolve(host).await,
        };

        if candidates.is_empty() {
            return Err(WaypointError::NoAddresses {
                host: host.to_string(),
            });
        }

        let mut last_error = None;
        for ip in candidates {
            let addr = SocketAddr::new(ip, port);
            match connect_one(addr, connect_timeout, source_address).await {
                Ok(stream) => {
                    debug!("Connected to {}", addr);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no candidate tried"));
        Err(WaypointError::DialFailed {
            target: format_authority(host, port),
            source,
        })
    }

    /// Resolve `query` by speaking DNS over TCP to `dns_server`, optionally
    /// tunnelled through an HTTP proxy
    pub async fn resolve_via_tcp(
        &self,
        query: &str,
        dns_server: &str,
        proxy: Option<&str>,
        credentials: Option<(&str, &str)>,
    ) -> Result<Vec<IpAddr>> {
        dns_tcp::resolve_via_tcp(self, query, dns_server, proxy, credentials).await
    }
}

async fn connect_one(
    addr: SocketAddr,
    connect_timeout: Duration,
    source_address: Option<SocketAddr>,
) -> io::Result<TcpStream> {
    if addr.ip() == UNRESOLVED {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "host is unresolved",
        ));
    }

    // The socket is dropped (closed) on every early return below.
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if let Some(source) = source_address {
        socket.bind(source)?;
    }

    match timeout(connect_timeout, socket.connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// Split `host[:port]` into its parts, accepting bracketed IPv6 literals.
///
/// A bare IPv6 literal (several colons, no brackets) is taken as a host with
/// the default port.
pub fn parse_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(WaypointError::InvalidEndpoint("empty address".to_string()));
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            WaypointError::InvalidEndpoint(format!("Invalid address '{}': unclosed bracket", addr))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(addr, port)?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(WaypointError::InvalidEndpoint(format!(
                    "Invalid address '{}'",
                    addr
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match addr.matches(':').count() {
        0 => Ok((addr.to_string(), default_port)),
        1 => {
            let (host, port) = addr.split_once(':').unwrap_or((addr, ""));
            Ok((host.to_string(), parse_port(addr, port)?))
        }
        _ => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(addr: &str, port: &str) -> Result<u16> {
    port.parse::<u16>().map_err(|_| {
        WaypointError::InvalidEndpoint(format!("Invalid address '{}': bad port", addr))
    })
}

/// Format `host:port`, bracketing IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
