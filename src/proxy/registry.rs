//! Registry of configured parent proxies
//!
//! Endpoints are kept by name, with HTTP and HTTPS candidate pools derived
//! from their priorities when they are added. Readers load the pools without
//! locking; writers rebuild the affected pool and swap it in.
//!
//! Pool order is the order in which names were first registered. It is
//! remembered across removal, so an endpoint that is removed and added again
//! returns to its original slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use http::Method;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::geo::GeoLocator;
use crate::models::{ProxyEndpoint, DIRECT, LOCAL};

/// Priorities outside this range keep an endpoint out of a pool
const POOL_PRIORITY_MIN: i32 = 0;
const POOL_PRIORITY_MAX: i32 = 100;

type Pool = Vec<Arc<ProxyEndpoint>>;

pub struct ProxyRegistry {
    entries: DashMap<String, Arc<ProxyEndpoint>>,
    /// First-registration sequence per name, kept after removal
    order: DashMap<String, u64>,
    next_order: AtomicU64,
    http_pool: ArcSwap<Pool>,
    https_pool: ArcSwap<Pool>,
    direct: ArcSwap<ProxyEndpoint>,
    local: ArcSwapOption<ProxyEndpoint>,
    /// Serializes writers so concurrent updates cannot lose each other's pool edits
    write_lock: Mutex<()>,
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyRegistry {
    /// Empty registry holding only the default `direct` endpoint
    pub fn new() -> Self {
        let direct = Arc::new(ProxyEndpoint::direct());
        let entries = DashMap::new();
        entries.insert(DIRECT.to_string(), direct.clone());

        Self {
            entries,
            order: DashMap::new(),
            next_order: AtomicU64::new(0),
            http_pool: ArcSwap::from_pointee(Vec::new()),
            https_pool: ArcSwap::from_pointee(Vec::new()),
            direct: ArcSwap::new(direct),
            local: ArcSwapOption::empty(),
            write_lock: Mutex::new(()),
        }
    }

    /// Parse `spec` and add the endpoint under `name`
    pub fn add_str(&self, name: &str, spec: &str) -> Result<Arc<ProxyEndpoint>> {
        let endpoint = Arc::new(ProxyEndpoint::parse(name, spec)?);
        self.insert(endpoint.clone());
        Ok(endpoint)
    }

    /// Add every `(name, spec)` pair, skipping definitions that fail to parse.
    ///
    /// Returns the number of endpoints added.
    pub fn load<'a, I>(&self, parents: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut added = 0;
        for (name, spec) in parents {
            match self.add_str(name, spec) {
                Ok(_) => added += 1,
                Err(e) if e.is_configuration_error() => {
                    warn!("Skipping parent proxy {}: {}", name, e);
                }
                Err(e) => warn!("Failed to add parent proxy {}: {}", name, e),
            }
        }
        added
    }

    pub fn add(&self, endpoint: ProxyEndpoint) -> Arc<ProxyEndpoint> {
        let endpoint = Arc::new(endpoint);
        self.insert(endpoint.clone());
        endpoint
    }

    /// Add or replace an endpoint.
    ///
    /// `direct` and `local` replace the singletons and never join a pool. A
    /// replaced endpoint keeps its position in the pools it stays eligible
    /// for, and a name seen before is placed back at its first-registration
    /// slot.
    pub fn insert(&self, endpoint: Arc<ProxyEndpoint>) {
        let _guard = self.write_lock.lock();

        info!(
            "Adding parent proxy {}: {}",
            endpoint.name(),
            endpoint
                .target()
                .map_or_else(|| "None".to_string(), ToString::to_string)
        );

        let previous = self
            .entries
            .insert(endpoint.name().to_string(), endpoint.clone());

        if endpoint.name() == DIRECT {
            self.direct.store(endpoint);
            return;
        }
        if endpoint.name() == LOCAL {
            self.local.store(Some(endpoint));
            return;
        }

        self.order
            .entry(endpoint.name().to_string())
            .or_insert_with(|| self.next_order.fetch_add(1, Ordering::Relaxed));

        self.update_pool(
            &self.http_pool,
            previous.as_ref(),
            &endpoint,
            in_pool_range(endpoint.http_priority()),
        );
        self.update_pool(
            &self.https_pool,
            previous.as_ref(),
            &endpoint,
            in_pool_range(endpoint.https_priority()),
        );
    }

    fn order_of(&self, name: &str) -> u64 {
        self.order.get(name).map_or(u64::MAX, |entry| *entry.value())
    }

    /// Apply one insertion to a pool, touching only the affected slot
    fn update_pool(
        &self,
        pool: &ArcSwap<Pool>,
        previous: Option<&Arc<ProxyEndpoint>>,
        endpoint: &Arc<ProxyEndpoint>,
        eligible: bool,
    ) {
        let current = pool.load();
        let slot = previous.and_then(|old| current.iter().position(|e| Arc::ptr_eq(e, old)));

        let next = match (slot, eligible) {
            (Some(index), true) => {
                let mut next = (**current).clone();
                next[index] = endpoint.clone();
                next
            }
            (Some(index), false) => {
                let mut next = (**current).clone();
                next.remove(index);
                next
            }
            (None, true) => {
                let rank = self.order_of(endpoint.name());
                let index = current
                    .iter()
                    .position(|e| self.order_of(e.name()) > rank)
                    .unwrap_or(current.len());
                let mut next = (**current).clone();
                next.insert(index, endpoint.clone());
                next
            }
            (None, false) => return,
        };
        pool.store(Arc::new(next));
    }

    /// Remove an endpoint by name. `direct` and `local` cannot be removed.
    pub fn remove(&self, name: &str) -> Option<Arc<ProxyEndpoint>> {
        if name == DIRECT || name == LOCAL {
            warn!("Refusing to remove the {} endpoint", name);
            return None;
        }

        let _guard = self.write_lock.lock();
        let (_, removed) = self.entries.remove(name)?;

        for pool in [&self.http_pool, &self.https_pool] {
            if pool.load().iter().any(|e| Arc::ptr_eq(e, &removed)) {
                pool.rcu(|current| {
                    current
                        .iter()
                        .filter(|e| !Arc::ptr_eq(e, &removed))
                        .cloned()
                        .collect::<Pool>()
                });
            }
        }

        debug!("Removed parent proxy {}", name);
        Some(removed)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyEndpoint>> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn direct(&self) -> Arc<ProxyEndpoint> {
        self.direct.load_full()
    }

    pub fn local(&self) -> Option<Arc<ProxyEndpoint>> {
        self.local.load_full()
    }

    pub fn http_pool(&self) -> Arc<Pool> {
        self.http_pool.load_full()
    }

    pub fn https_pool(&self) -> Arc<Pool> {
        self.https_pool.load_full()
    }

    /// Candidate pool for a request method: HTTPS for CONNECT, HTTP otherwise
    pub fn pool_for(&self, method: &Method) -> Arc<Pool> {
        if method == Method::CONNECT {
            self.https_pool()
        } else {
            self.http_pool()
        }
    }

    /// Every registered endpoint except the `direct` and `local` singletons
    pub fn parents(&self) -> Vec<Arc<ProxyEndpoint>> {
        let mut parents = self
            .entries
            .iter()
            .filter(|entry| entry.key() != DIRECT && entry.key() != LOCAL)
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        parents.sort_by(|a, b| a.name().cmp(b.name()));
        parents
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Score the candidate pool for a request, best first.
    ///
    /// Equal scores keep pool (insertion) order.
    pub async fn rank(
        &self,
        method: &Method,
        host: Option<&str>,
        country_code: Option<&str>,
        geo: &GeoLocator,
    ) -> Result<Vec<(f64, Arc<ProxyEndpoint>)>> {
        let pool = self.pool_for(method);
        let mut scored = Vec::with_capacity(pool.len());
        for endpoint in pool.iter() {
            let score = endpoint.priority(method, host, country_code, geo).await?;
            scored.push((score, endpoint.clone()));
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(scored)
    }

    /// Lowest-scoring endpoint for a request, `None` when the pool is empty
    pub async fn select(
        &self,
        method: &Method,
        host: Option<&str>,
        country_code: Option<&str>,
        geo: &GeoLocator,
    ) -> Result<Option<Arc<ProxyEndpoint>>> {
        let ranked = self.rank(method, host, country_code, geo).await?;
        Ok(ranked.into_iter().next().map(|(score, endpoint)| {
            debug!("Selected {} with score {:.3}", endpoint, score);
            endpoint
        }))
    }
}

fn in_pool_range(priority: i32) -> bool {
    (POOL_PRIORITY_MIN..=POOL_PRIORITY_MAX).contains(&priority)
}
