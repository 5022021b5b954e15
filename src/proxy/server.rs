//! Port forwarder
//!
//! Accepts TCP connections on a local address and relays each one to a fixed
//! target through the best-scoring parent proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use http::Method;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::geo::GeoLocator;
use crate::models::ProxyEndpoint;
use crate::proxy::dialer::format_authority;
use crate::proxy::registry::ProxyRegistry;
use crate::proxy::tunnel::TunnelHandler;

#[derive(Debug, Clone)]
pub struct ForwardServerConfig {
    pub listen: SocketAddr,
    pub target_host: String,
    pub target_port: u16,
}

/// Shared state handed to every connection task
struct Route {
    registry: Arc<ProxyRegistry>,
    geo: Arc<GeoLocator>,
    tunnels: Arc<TunnelHandler>,
    target_host: String,
    target_port: u16,
}

pub struct ForwardServer {
    config: ForwardServerConfig,
    route: Arc<Route>,
}

impl ForwardServer {
    pub fn new(
        config: ForwardServerConfig,
        registry: Arc<ProxyRegistry>,
        geo: Arc<GeoLocator>,
        tunnels: Arc<TunnelHandler>,
    ) -> Self {
        let route = Arc::new(Route {
            registry,
            geo,
            tunnels,
            target_host: config.target_host.clone(),
            target_port: config.target_port,
        });
        Self { config, route }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            "Forwarding {} to {}",
            listener.local_addr()?,
            format_authority(&self.config.target_host, self.config.target_port)
        );

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let route = self.route.clone();
                            tokio::spawn(async move {
                                if let Err(e) = route.handle_connection(stream, client_addr).await {
                                    debug!("Connection from {} ended: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Port forwarder shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Route {
    async fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        let host = self.target_host.as_str();
        debug!("Accepted {} for {}", client_addr, host);

        let candidates = self.candidates(host).await?;
        let tunnel = self
            .tunnels
            .open_first(&candidates, host, self.target_port)
            .await?;
        self.tunnels.relay_tunnel(stream, tunnel, host).await?;
        Ok(())
    }

    /// Ranked parents for the target, or the direct endpoint when none is
    /// eligible
    async fn candidates(&self, host: &str) -> Result<Vec<Arc<ProxyEndpoint>>> {
        let country_code = self.geo.locate_host(host).await;
        let ranked = match country_code.as_deref() {
            Some(country_code) => {
                self.registry
                    .rank(&Method::CONNECT, Some(host), Some(country_code), &self.geo)
                    .await?
            }
            None => {
                self.registry
                    .rank(&Method::CONNECT, None, None, &self.geo)
                    .await?
            }
        };

        let mut candidates = ranked
            .into_iter()
            .map(|(_, endpoint)| endpoint)
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            candidates.push(self.registry.direct());
        }
        Ok(candidates)
    }
}
