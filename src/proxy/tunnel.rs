//! Routing sessions: open a tunnel through a chosen endpoint and relay a
//! client over it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, WaypointError};
use crate::models::ProxyEndpoint;
use crate::proxy::dialer::{format_authority, Dialer};
use crate::proxy::forward::{forward, DEFAULT_BUFFER_SIZE};
use crate::proxy::transport::{BoxedConnection, ProxyTransport};

/// Default idle timeout for relayed sessions
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunnel handler configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Per-read/write idle timeout while forwarding
    pub idle_timeout: Duration,
    /// Forwarding buffer size per direction
    pub buffer_size: usize,
    /// Extra candidates tried after the first one fails
    pub max_retries: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_retries: 2,
        }
    }
}

/// An established upstream tunnel
pub struct Tunnel {
    pub endpoint: Arc<ProxyEndpoint>,
    pub connection: BoxedConnection,
    /// Time taken to get a live upstream
    pub rtime: Duration,
}

/// Opens tunnels through endpoints and relays sessions over them
pub struct TunnelHandler {
    dialer: Arc<Dialer>,
    config: TunnelConfig,
}

impl TunnelHandler {
    pub fn new(dialer: Arc<Dialer>, config: TunnelConfig) -> Self {
        Self { dialer, config }
    }

    /// Connect to `host:port` through `endpoint`, timing the setup
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint))]
    pub async fn open(
        &self,
        endpoint: &Arc<ProxyEndpoint>,
        host: &str,
        port: u16,
    ) -> Result<Tunnel> {
        let started = Instant::now();
        let connection = ProxyTransport::connect(&self.dialer, endpoint, host, port).await?;
        let rtime = started.elapsed();

        debug!(
            "Tunnel to {} through {} ready in {:.3}s",
            format_authority(host, port),
            endpoint,
            rtime.as_secs_f64()
        );

        Ok(Tunnel {
            endpoint: endpoint.clone(),
            connection,
            rtime,
        })
    }

    /// Try `candidates` in order until one yields a tunnel.
    ///
    /// At most `max_retries + 1` candidates are attempted; the last failure
    /// is returned when none succeeds.
    pub async fn open_first(
        &self,
        candidates: &[Arc<ProxyEndpoint>],
        host: &str,
        port: u16,
    ) -> Result<Tunnel> {
        let max_attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for (attempt, endpoint) in candidates.iter().take(max_attempts).enumerate() {
            debug!(
                "Connecting to {} through {} (attempt {}/{})",
                format_authority(host, port),
                endpoint,
                attempt + 1,
                max_attempts
            );

            match self.open(endpoint, host, port).await {
                Ok(tunnel) => return Ok(tunnel),
                Err(e) => {
                    warn!(
                        "Connecting through {} failed: {} (attempt {}/{})",
                        endpoint,
                        e,
                        attempt + 1,
                        max_attempts
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(WaypointError::NoEndpointsAvailable))
    }

    /// Forward `client` over an opened tunnel, then record its setup time
    /// against the endpoint.
    pub async fn relay_tunnel<C>(
        &self,
        client: C,
        tunnel: Tunnel,
        host: &str,
    ) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Tunnel {
            endpoint,
            connection,
            rtime,
        } = tunnel;

        let result = forward(
            client,
            connection,
            self.config.idle_timeout,
            self.config.buffer_size,
        )
        .await;

        endpoint.log(Some(host), rtime);
        match &result {
            Ok((sent, received)) => info!(
                "{} via {}: {} bytes out, {} bytes in, {:.3}s",
                host,
                endpoint,
                sent,
                received,
                rtime.as_secs_f64()
            ),
            Err(e) => warn!("{} via {} ended with error: {}", host, endpoint, e),
        }
        result
    }

    /// Relay `client` to `host:port` through `endpoint`.
    ///
    /// A failure to reach the target is returned without touching the
    /// endpoint's latency record.
    pub async fn relay<C>(
        &self,
        client: C,
        endpoint: &Arc<ProxyEndpoint>,
        host: &str,
        port: u16,
    ) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let tunnel = self.open(endpoint, host, port).await?;
        self.relay_tunnel(client, tunnel, host).await
    }
}
