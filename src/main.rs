//! Waypoint - Entry Point
//!
//! Loads the parent proxies, starts the health checker and the optional port
//! forwarder, and runs until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use waypoint::config::{Config, LogConfig};
use waypoint::geo::{CountryLookup, GeoLocator, PrefixTable};
use waypoint::proxy::{
    Dialer, ForwardServer, ForwardServerConfig, HealthChecker, HealthCheckerHandle,
    ProxyRegistry, TunnelHandler,
};
use waypoint::resolver::CachingResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting Waypoint");

    let resolver = Arc::new(CachingResolver::new(config.resolver.clone()));
    let mut dialer = Dialer::new(resolver);
    if let Some(fallback) = config.dns.clone() {
        info!("DNS over TCP fallback via {}", fallback.server);
        dialer = dialer.with_dns_fallback(fallback);
    }
    let dialer = Arc::new(dialer);

    let lookup: Arc<dyn CountryLookup> = match &config.geoip_table {
        Some(path) => Arc::new(
            PrefixTable::from_file(path)
                .await
                .with_context(|| format!("failed to load geoip table {}", path.display()))?,
        ),
        None => {
            warn!("GEOIP_TABLE not set; endpoints will not be geo-located");
            Arc::new(PrefixTable::new())
        }
    };
    let geo = Arc::new(GeoLocator::new(dialer.clone(), lookup));

    let registry = Arc::new(ProxyRegistry::new());
    let added = registry.load(
        config
            .parents
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.as_str())),
    );
    info!(
        "Loaded {} parent proxies ({} HTTP, {} HTTPS candidates)",
        added,
        registry.http_pool().len(),
        registry.https_pool().len()
    );

    let tunnels = Arc::new(TunnelHandler::new(
        dialer.clone(),
        config.forward.tunnel_config(),
    ));

    let (shutdown_tx, _) = watch::channel(false);

    let (health_handle, health_shutdown) = HealthCheckerHandle::new();
    let health_task = config.health.clone().map(|health_config| {
        let checker = HealthChecker::new(
            registry.clone(),
            dialer.clone(),
            geo.clone(),
            health_config,
        );
        tokio::spawn(async move { checker.run(health_shutdown).await })
    });

    let forward_task = match (config.forward.listen, config.forward.target.clone()) {
        (Some(listen), Some((target_host, target_port))) => {
            let server = ForwardServer::new(
                ForwardServerConfig {
                    listen,
                    target_host,
                    target_port,
                },
                registry.clone(),
                geo.clone(),
                tunnels.clone(),
            );
            let shutdown = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = server.run(shutdown).await {
                    error!("Port forwarder error: {}", e);
                }
            }))
        }
        _ => None,
    };

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    health_handle.shutdown();

    if let Some(task) = health_task {
        let _ = task.await;
    }
    if let Some(task) = forward_task {
        let _ = task.await;
    }

    info!("Waypoint stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("waypoint={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
