//! Waypoint - Parent Proxy Routing Core
//!
//! Picks the best upstream proxy for a destination and relays traffic
//! through it.
//!
//! ## Features
//!
//! - Scoring by configured priority, geographic affinity and smoothed latency
//! - Cached hostname resolution with a DNS-over-TCP fallback
//! - Dialing with per-address failover
//! - HTTP CONNECT tunnelling, including proxy chains
//! - Duplex forwarding with per-direction idle timeouts
//! - Background health checking of parent proxies

pub mod config;
pub mod error;
pub mod geo;
pub mod models;
pub mod proxy;
pub mod resolver;

pub use config::Config;
pub use error::{Result, WaypointError};
