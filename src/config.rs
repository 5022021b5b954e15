use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, WaypointError};
use crate::proxy::dialer::{parse_host_port, DnsFallback};
use crate::proxy::forward::DEFAULT_BUFFER_SIZE;
use crate::proxy::health::HealthCheckerConfig;
use crate::proxy::tunnel::TunnelConfig;
use crate::resolver::ResolverConfig;

/// Prefix of the variables defining parent proxies
const PARENT_PREFIX: &str = "PARENT_PROXY_";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Parent proxy definitions as `(name, spec)`, sorted by name
    pub parents: Vec<(String, String)>,
    /// Resolver cache bounds
    pub resolver: ResolverConfig,
    /// DNS-over-TCP fallback, enabled when `DNS_SERVER` or `DNS_PROXY` is set
    pub dns: Option<DnsFallback>,
    /// Optional `CIDR COUNTRY` table for the country lookup
    pub geoip_table: Option<PathBuf>,
    /// Forwarding configuration
    pub forward: ForwardConfig,
    /// Health checking, disabled when the interval is zero
    pub health: Option<HealthCheckerConfig>,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Idle timeout per read/write
    pub timeout: Duration,
    /// Buffer size per direction
    pub buffer_size: usize,
    /// Extra parents tried when the first one fails
    pub max_retries: usize,
    /// Port forwarder listen address
    pub listen: Option<SocketAddr>,
    /// Port forwarder destination
    pub target: Option<(String, u16)>,
}

impl ForwardConfig {
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            idle_timeout: self.timeout,
            buffer_size: self.buffer_size,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            parents: parse_parents(),
            resolver: ResolverConfig {
                capacity: get_env_parsed("RESOLVER_CACHE_SIZE", 4096)?,
                ttl: Duration::from_secs(get_env_parsed("RESOLVER_CACHE_TTL", 90)?),
                lookup_timeout: Duration::from_secs(get_env_parsed(
                    "RESOLVER_LOOKUP_TIMEOUT",
                    5,
                )?),
                ..ResolverConfig::default()
            },
            dns: parse_dns_fallback()?,
            geoip_table: get_env_opt("GEOIP_TABLE").map(PathBuf::from),
            forward: parse_forward()?,
            health: parse_health()?,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

fn parse_parents() -> Vec<(String, String)> {
    let mut parents = env::vars()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(PARENT_PREFIX)?.to_lowercase();
            (!name.is_empty()).then_some((name, value))
        })
        .collect::<Vec<_>>();
    parents.sort();
    parents
}

fn parse_dns_fallback() -> Result<Option<DnsFallback>> {
    let server = get_env_opt("DNS_SERVER");
    let proxy = get_env_opt("DNS_PROXY");
    if server.is_none() && proxy.is_none() {
        return Ok(None);
    }

    let defaults = DnsFallback::default();
    let server = server.unwrap_or(defaults.server);
    parse_host_port(&server, 53).map_err(|e| {
        WaypointError::InvalidConfig(format!("DNS_SERVER must be host[:port]: {}", e))
    })?;

    if let Some(proxy) = &proxy {
        parse_host_port(proxy, 80).map_err(|e| {
            WaypointError::InvalidConfig(format!("DNS_PROXY must be host[:port]: {}", e))
        })?;
    }

    let credentials = get_env_opt("DNS_PROXY_USER")
        .map(|user| (user, get_env_or("DNS_PROXY_PASSWORD", "")));

    Ok(Some(DnsFallback {
        server,
        proxy,
        credentials,
    }))
}

fn parse_forward() -> Result<ForwardConfig> {
    let listen = match get_env_opt("FORWARD_LISTEN") {
        Some(raw) => Some(raw.parse::<SocketAddr>().map_err(|_| {
            WaypointError::InvalidConfig("FORWARD_LISTEN must be a socket address".into())
        })?),
        None => None,
    };

    let target = match get_env_opt("FORWARD_TARGET") {
        Some(raw) => Some(parse_required_port("FORWARD_TARGET", &raw)?),
        None => None,
    };

    if listen.is_some() != target.is_some() {
        return Err(WaypointError::InvalidConfig(
            "FORWARD_LISTEN and FORWARD_TARGET must be set together".into(),
        ));
    }

    let buffer_size = get_env_parsed("FORWARD_BUFFER_SIZE", DEFAULT_BUFFER_SIZE)?;
    if buffer_size == 0 {
        return Err(WaypointError::InvalidConfig(
            "FORWARD_BUFFER_SIZE must be positive".into(),
        ));
    }

    Ok(ForwardConfig {
        timeout: Duration::from_secs(get_env_parsed("FORWARD_TIMEOUT", 60)?),
        buffer_size,
        max_retries: get_env_parsed("FORWARD_RETRIES", 2)?,
        listen,
        target,
    })
}

fn parse_health() -> Result<Option<HealthCheckerConfig>> {
    let interval: u64 = get_env_parsed("HEALTHCHECK_INTERVAL", 300)?;
    if interval == 0 {
        return Ok(None);
    }

    let (target_host, target_port) = parse_host_port(
        &get_env_or("HEALTHCHECK_TARGET", "www.google.com:80"),
        80,
    )
    .map_err(|e| WaypointError::InvalidConfig(format!("HEALTHCHECK_TARGET: {}", e)))?;

    Ok(Some(HealthCheckerConfig {
        check_interval: Duration::from_secs(interval),
        target_host,
        target_port,
        workers: get_env_parsed("HEALTHCHECK_WORKERS", 8)?,
    }))
}

fn parse_required_port(key: &str, raw: &str) -> Result<(String, u16)> {
    match parse_host_port(raw, 0) {
        Ok((host, port)) if port != 0 && !host.is_empty() => Ok((host, port)),
        _ => Err(WaypointError::InvalidConfig(format!(
            "{} must be host:port",
            key
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a non-empty environment variable
fn get_env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse an environment variable, falling back to `default` when unset
fn get_env_parsed<T: FromStr>(key: &str, default: T) -> Result<T> {
    match get_env_opt(key) {
        Some(raw) => raw.parse::<T>().map_err(|_| {
            WaypointError::InvalidConfig(format!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}
