//! Parent proxy routing
//!
//! This module provides:
//! - Dialing with per-address failover and DNS-over-TCP fallback
//! - HTTP CONNECT tunnelling through endpoints and endpoint chains
//! - The endpoint registry and score-based selection
//! - Bidirectional forwarding of routed sessions
//! - Health checking and the optional port forwarder

pub mod dialer;
pub mod forward;
pub mod health;
pub mod registry;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use dialer::{DnsFallback, Dialer};
pub use forward::forward;
pub use health::{HealthChecker, HealthCheckerConfig, HealthCheckerHandle};
pub use registry::ProxyRegistry;
pub use server::{ForwardServer, ForwardServerConfig};
pub use transport::{BoxedConnection, ProxyTransport};
pub use tunnel::{Tunnel, TunnelConfig, TunnelHandler};
