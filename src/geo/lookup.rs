//! IP address to country code lookup

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::info;

use crate::error::{Result, WaypointError};

/// Maps an IP address to a two-letter country code
#[async_trait]
pub trait CountryLookup: Send + Sync {
    async fn country_of(&self, ip: IpAddr) -> Option<String>;
}

/// In-memory longest-prefix table of networks to country codes
#[derive(Debug, Clone, Default)]
pub struct PrefixTable {
    /// Kept sorted by descending prefix length so the first hit is the longest
    entries: Vec<(IpNet, String)>,
}

impl PrefixTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet, country_code: &str) {
        let net = net.trunc();
        let position = self
            .entries
            .iter()
            .position(|(existing, _)| existing.prefix_len() < net.prefix_len())
            .unwrap_or(self.entries.len());
        self.entries
            .insert(position, (net, country_code.to_ascii_uppercase()));
    }

    /// Parse `CIDR COUNTRY` lines; blank lines and `#` comments are skipped
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = Self::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(net), Some(country_code), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(WaypointError::InvalidConfig(format!(
                    "geoip table line {}: expected 'CIDR COUNTRY'",
                    index + 1
                )));
            };

            let net = net.parse::<IpNet>().map_err(|e| {
                WaypointError::InvalidConfig(format!("geoip table line {}: {}", index + 1, e))
            })?;
            table.insert(net, country_code);
        }
        Ok(table)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let table = Self::parse(&text)?;
        info!("Loaded {} geoip prefixes from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn get(&self, ip: IpAddr) -> Option<&str> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, country_code)| country_code.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CountryLookup for PrefixTable {
    async fn country_of(&self, ip: IpAddr) -> Option<String> {
        self.get(ip).map(str::to_string)
    }
}
