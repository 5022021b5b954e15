//! Health checking for parent proxies
//!
//! Periodically tunnels through every registered endpoint to a known target.
//! Endpoints that fail are taken out of the registry and parked; parked
//! endpoints that pass a later round are put back.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::geo::GeoLocator;
use crate::models::ProxyEndpoint;
use crate::proxy::dialer::{format_authority, Dialer};
use crate::proxy::registry::ProxyRegistry;
use crate::proxy::transport::ProxyTransport;

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Interval between health check rounds
    pub check_interval: Duration,
    /// Host every endpoint is asked to reach
    pub target_host: String,
    pub target_port: u16,
    /// Endpoints checked concurrently
    pub workers: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            target_host: "www.google.com".to_string(),
            target_port: 80,
            workers: 8,
        }
    }
}

/// Outcome of one health check round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: usize,
    pub unhealthy: usize,
    /// Endpoints taken out of the registry this round
    pub parked: usize,
    /// Parked endpoints put back this round
    pub restored: usize,
}

pub struct HealthChecker {
    registry: Arc<ProxyRegistry>,
    dialer: Arc<Dialer>,
    geo: Arc<GeoLocator>,
    config: HealthCheckerConfig,
    parked: DashMap<String, Arc<ProxyEndpoint>>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        dialer: Arc<Dialer>,
        geo: Arc<GeoLocator>,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            registry,
            dialer,
            geo,
            config,
            parked: DashMap::new(),
        }
    }

    /// Run the health checker until `shutdown` flips to true
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health checker with {}s interval",
            self.config.check_interval.as_secs()
        );

        let mut check_interval = interval(self.config.check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    self.check_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Names of endpoints currently out of rotation
    pub fn parked(&self) -> Vec<String> {
        let mut names = self
            .parked
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Check every registered and parked endpoint once
    pub async fn check_all(&self) -> HealthReport {
        let mut endpoints = self.registry.parents();
        endpoints.extend(self.parked.iter().map(|entry| entry.value().clone()));

        info!("Checking health of {} endpoints", endpoints.len());

        let results = futures::stream::iter(endpoints)
            .map(|endpoint| async move {
                let healthy = self.check_endpoint(&endpoint).await;
                (endpoint, healthy)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = HealthReport::default();
        for (endpoint, healthy) in results {
            let name = endpoint.name().to_string();
            if healthy {
                report.healthy += 1;
                if self.parked.remove(&name).is_some() {
                    // A fresh definition added under the same name wins.
                    if self.registry.get(&name).is_none() {
                        self.registry.insert(endpoint);
                        report.restored += 1;
                        info!("Endpoint {} recovered", name);
                    }
                }
            } else {
                report.unhealthy += 1;
                let registered = self
                    .registry
                    .get(&name)
                    .is_some_and(|current| Arc::ptr_eq(&current, &endpoint));
                if registered {
                    self.registry.remove(&name);
                    self.parked.insert(name, endpoint);
                    report.parked += 1;
                }
            }
        }

        info!(
            "Health check complete: {} healthy, {} unhealthy, {} parked, {} restored",
            report.healthy, report.unhealthy, report.parked, report.restored
        );
        report
    }

    /// Check a single endpoint by tunnelling to the configured target
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint))]
    async fn check_endpoint(&self, endpoint: &ProxyEndpoint) -> bool {
        if let Some(country_code) = self.geo.locate(endpoint).await {
            debug!("{} is in {}", endpoint, country_code);
        }

        let target = format_authority(&self.config.target_host, self.config.target_port);
        let connect_result = timeout(
            endpoint.timeout(),
            ProxyTransport::connect(
                &self.dialer,
                endpoint,
                &self.config.target_host,
                self.config.target_port,
            ),
        )
        .await;

        match connect_result {
            Ok(Ok(_conn)) => {
                debug!("{} is healthy (reached {})", endpoint, target);
                true
            }
            Ok(Err(e)) => {
                warn!("{} is unhealthy: connect to {} failed: {}", endpoint, target, e);
                false
            }
            Err(_) => {
                warn!("{} is unhealthy: connect to {} timed out", endpoint, target);
                false
            }
        }
    }
}

/// Guard for managing health checker lifecycle
pub struct HealthCheckerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl HealthCheckerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
