//! Endpoint geo-location
//!
//! [`GeoLocator`] answers "which country is this proxy in?" for scoring. Public
//! proxy addresses are looked up directly; a proxy bound to a loopback or
//! private address is asked for its external IP by fetching a "what is my IP"
//! page through the proxy itself.

pub mod continent;
pub mod lookup;

pub use continent::{continent_of, same_continent, Continent};
pub use lookup::{CountryLookup, PrefixTable};

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, warn};

use crate::error::{Result, WaypointError};
use crate::models::ProxyEndpoint;
use crate::proxy::dialer::{format_authority, Dialer};
use crate::proxy::transport::{read_response_head, ProxyTransport};
use crate::resolver::UNRESOLVED;

/// Minimum time between two location attempts for the same endpoint
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(300);

pub const PROBE_HOST: &str = "bot.whatismyipaddress.com";
pub const PROBE_PORT: u16 = 80;

const PROBE_USER_AGENT: &str = concat!("waypoint/", env!("CARGO_PKG_VERSION"));

/// Upper bound on the probe body; it only ever holds an address
const MAX_PROBE_BODY: usize = 256;

pub struct GeoLocator {
    dialer: Arc<Dialer>,
    lookup: Arc<dyn CountryLookup>,
    probe_host: String,
    probe_port: u16,
}

impl GeoLocator {
    pub fn new(dialer: Arc<Dialer>, lookup: Arc<dyn CountryLookup>) -> Self {
        Self {
            dialer,
            lookup,
            probe_host: PROBE_HOST.to_string(),
            probe_port: PROBE_PORT,
        }
    }

    /// Use a different external-IP service for self-probes
    pub fn with_probe_target(mut self, host: &str, port: u16) -> Self {
        self.probe_host = host.to_string();
        self.probe_port = port;
        self
    }

    /// Country code of `endpoint`, or `None` when it cannot be determined.
    ///
    /// A known code is returned immediately. Otherwise at most one attempt is
    /// made per [`RECHECK_INTERVAL`]; failures are logged and yield `None`.
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint))]
    pub async fn locate(&self, endpoint: &ProxyEndpoint) -> Option<String> {
        {
            let mut state = endpoint.geo_state().lock();
            if let Some(country_code) = &state.country_code {
                return Some(country_code.clone());
            }
            let now = Instant::now();
            if let Some(at) = state.last_check {
                if now.saturating_duration_since(at) < RECHECK_INTERVAL {
                    return None;
                }
            }
            state.last_check = Some(now);
        }

        let target = endpoint.target()?;
        let ip = self.dialer.resolver().resolve_single(&target.host).await;
        if ip == UNRESOLVED {
            debug!("Cannot locate {}: host unresolved", target.host);
            return None;
        }

        let country_code = if needs_self_probe(ip) {
            match self.self_probe(endpoint).await {
                Ok(external) => self.lookup.country_of(external).await,
                Err(e) => {
                    warn!("Self-probe through {} failed: {}", endpoint, e);
                    None
                }
            }
        } else {
            self.lookup.country_of(ip).await
        };

        let country_code = country_code.map(|code| code.to_ascii_uppercase());
        if let Some(code) = &country_code {
            debug!("{} is located in {}", endpoint, code);
            endpoint.geo_state().lock().country_code = Some(code.clone());
        }
        country_code
    }

    /// Country code of an arbitrary destination host
    pub async fn locate_host(&self, host: &str) -> Option<String> {
        let ip = self.dialer.resolver().resolve_single(host).await;
        if ip == UNRESOLVED {
            return None;
        }
        self.lookup
            .country_of(ip)
            .await
            .map(|code| code.to_ascii_uppercase())
    }

    /// Fetch the endpoint's external address from the probe service
    async fn self_probe(&self, endpoint: &ProxyEndpoint) -> Result<IpAddr> {
        timeout(endpoint.timeout(), self.fetch_external_ip(endpoint)).await?
    }

    async fn fetch_external_ip(&self, endpoint: &ProxyEndpoint) -> Result<IpAddr> {
        let stream =
            ProxyTransport::connect(&self.dialer, endpoint, &self.probe_host, self.probe_port)
                .await?;
        let mut reader = BufReader::new(stream);

        let request = format!(
            "GET / HTTP/1.1\r\n\
             Connection: keep_alive\r\n\
             Host: {}\r\n\
             Accept-Encoding: identity\r\n\
             User-Agent: {}\r\n\r\n",
            host_header(&self.probe_host, self.probe_port),
            PROBE_USER_AGENT
        );
        reader.get_mut().write_all(request.as_bytes()).await?;
        reader.get_mut().flush().await?;

        let head = read_response_head(&mut reader).await?;
        if head.status != StatusCode::OK {
            return Err(WaypointError::Http(format!(
                "probe answered '{}'",
                head.status_line
            )));
        }

        let length = head
            .content_length()
            .ok_or_else(|| WaypointError::Http("probe response has no Content-Length".to_string()))?;
        if length == 0 || length > MAX_PROBE_BODY {
            return Err(WaypointError::Http(format!(
                "unexpected probe body length {}",
                length
            )));
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await.map_err(|e| {
            WaypointError::Http(format!("short probe body: {}", e))
        })?;

        let text = String::from_utf8_lossy(&body);
        text.trim()
            .parse::<IpAddr>()
            .map_err(|_| WaypointError::Http(format!("probe body '{}' is not an address", text.trim())))
    }
}

fn host_header(host: &str, port: u16) -> String {
    if port == PROBE_PORT {
        host.to_string()
    } else {
        format_authority(host, port)
    }
}

/// Addresses whose external identity is only visible through the proxy
fn needs_self_probe(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => needs_self_probe(IpAddr::V4(v4)),
            None => v6.is_loopback() || is_unique_local(&v6) || is_unicast_link_local(&v6),
        },
    }
}

fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}
