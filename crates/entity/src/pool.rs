//! Adapter pool manager.
//!
//! The pool keeps one connected [`Adapter`] per tenant hash. A
//! [`TenantResolver`] maps each operation context to a hash and a backend
//! configuration; the first access for a hash builds and connects the
//! adapter, later accesses reuse it.
//!
//! # Concurrency
//!
//! Concurrent first accesses to the same hash share a single connection
//! attempt through an in-flight map of [`OnceCell`]s. The pool map itself is
//! guarded by a `parking_lot` mutex that is never held across an `.await`.
//!
//! # Eviction
//!
//! With `max_pool_size` set, every registration is followed by
//! [`AdapterPool::maintain`], which disconnects the least recently used
//! adapters until the pool fits.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use helios_entity::adapter::{AdapterConfig, DefaultAdapterFactory};
//! use helios_entity::config::PoolSettings;
//! use helios_entity::pool::AdapterPool;
//! use helios_entity::strategy::{DatabasePerTenantConfig, TenancyStrategy};
//! use helios_entity::tenant::OperationContext;
//!
//! # tokio_test::block_on(async {
//! let pool = AdapterPool::new(AdapterConfig::memory("posts"), Arc::new(DefaultAdapterFactory::new()))
//!     .with_resolver(TenancyStrategy::DatabasePerTenant(DatabasePerTenantConfig::default()).into_resolver())
//!     .with_settings(PoolSettings::new().with_max_pool_size(1))
//!     .unwrap();
//!
//! let a = pool.get_adapter(&OperationContext::for_tenant("a")).await.unwrap();
//! let _b = pool.get_adapter(&OperationContext::for_tenant("b")).await.unwrap();
//!
//! assert_eq!(pool.len(), 1);
//! assert!(!a.is_connected());
//! # });
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, AdapterConfig, AdapterFactory};
use crate::config::{PoolSettings, check};
use crate::error::{ConfigurationError, EntityResult};
use crate::strategy::{SingleStrategy, TenantResolution, TenantResolver};
use crate::tenant::OperationContext;

/// Observes adapter lifecycle events.
///
/// Both methods default to no-ops.
#[async_trait]
pub trait LifecycleListener: Send + Sync + fmt::Debug {
    /// Called once a newly connected adapter has been pooled.
    async fn adapter_connected(&self, _adapter: &Arc<dyn Adapter>, _hash: &str, _config: &AdapterConfig) {}

    /// Called after an adapter left the pool and was disconnected.
    async fn adapter_disconnected(&self, _adapter: &Arc<dyn Adapter>, _hash: &str) {}
}

struct PoolEntry {
    adapter: Arc<dyn Adapter>,
    last_used_at: Instant,
    /// Logical clock value of the last access; orders eviction.
    last_used: u64,
}

type InFlight = Arc<OnceCell<Arc<dyn Adapter>>>;

/// Bounded pool of connected adapters keyed by tenant hash.
pub struct AdapterPool {
    base: AdapterConfig,
    factory: Arc<dyn AdapterFactory>,
    resolver: Arc<dyn TenantResolver>,
    settings: PoolSettings,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    clock: AtomicU64,
}

impl fmt::Debug for AdapterPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterPool")
            .field("base", &self.base)
            .field("resolver", &self.resolver)
            .field("settings", &self.settings)
            .field("pooled", &self.len())
            .finish_non_exhaustive()
    }
}

impl AdapterPool {
    /// Creates an unbounded pool with the single-adapter strategy.
    pub fn new(base: AdapterConfig, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            base,
            factory,
            resolver: Arc::new(SingleStrategy::new()),
            settings: PoolSettings::default(),
            listeners: Vec::new(),
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Sets the tenant resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets and validates the pool settings.
    pub fn with_settings(mut self, settings: PoolSettings) -> Result<Self, ConfigurationError> {
        check(settings.validate())?;
        self.settings = settings;
        Ok(self)
    }

    /// Adds a lifecycle listener.
    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Returns the static adapter configuration.
    pub fn base_config(&self) -> &AdapterConfig {
        &self.base
    }

    /// Returns the pool settings.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Resolves the tenant hash and configuration for `ctx` without touching
    /// the pool.
    pub fn resolve(&self, ctx: &OperationContext) -> TenantResolution {
        self.resolver.resolve(ctx, &self.base)
    }

    /// Returns the adapter for `ctx`, creating and connecting it on first
    /// use.
    ///
    /// Connect failures are retried forever every `reconnect_delay` when
    /// `auto_reconnect` is on; otherwise the error is returned and the next
    /// call tries again.
    pub async fn get_adapter(&self, ctx: &OperationContext) -> EntityResult<Arc<dyn Adapter>> {
        let resolution = self.resolve(ctx);
        if let Some(adapter) = self.touch(&resolution.hash) {
            return Ok(adapter);
        }

        // Entries are registered before their cell is released; checking
        // again under the in-flight lock stops a late caller from connecting twice.
        let cell = {
            let mut in_flight = self.in_flight.lock();
            if let Some(adapter) = self.touch(&resolution.hash) {
                return Ok(adapter);
            }
            in_flight
                .entry(resolution.hash.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| self.create(&resolution))
            .await
            .cloned();

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&resolution.hash)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                in_flight.remove(&resolution.hash);
            }
        }

        let adapter = result?;
        self.touch(&resolution.hash);
        self.maintain().await?;
        Ok(adapter)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn touch(&self, hash: &str) -> Option<Arc<dyn Adapter>> {
        let tick = self.tick();
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(hash)?;
        entry.last_used = tick;
        entry.last_used_at = Instant::now();
        Some(entry.adapter.clone())
    }

    async fn create(&self, resolution: &TenantResolution) -> EntityResult<Arc<dyn Adapter>> {
        let hash = &resolution.hash;
        let adapter = self.factory.create(&resolution.config)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match adapter.connect().await {
                Ok(()) => break,
                Err(e) if self.settings.auto_reconnect => {
                    warn!(
                        tenant_hash = %hash,
                        attempt,
                        delay = ?self.settings.reconnect_delay,
                        error = %e,
                        "Adapter connect failed, retrying"
                    );
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        let tick = self.tick();
        let pooled = {
            let mut entries = self.entries.lock();
            match entries.entry(hash.clone()) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.last_used = tick;
                    entry.last_used_at = Instant::now();
                    Some(entry.adapter.clone())
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(PoolEntry {
                        adapter: adapter.clone(),
                        last_used_at: Instant::now(),
                        last_used: tick,
                    });
                    None
                }
            }
        };
        if let Some(pooled) = pooled {
            warn!(tenant_hash = %hash, "Adapter already pooled, dropping duplicate");
            if let Err(e) = adapter.disconnect().await {
                warn!(tenant_hash = %hash, error = %e, "Duplicate adapter failed to disconnect");
            }
            return Ok(pooled);
        }

        info!(
            tenant_hash = %hash,
            adapter = adapter.name(),
            attempts = attempt,
            "Adapter connected"
        );

        for listener in &self.listeners {
            listener
                .adapter_connected(&adapter, hash, &resolution.config)
                .await;
        }
        Ok(adapter)
    }

    /// Evicts least recently used adapters until the pool fits
    /// `max_pool_size`. Returns the number of evicted adapters.
    pub async fn maintain(&self) -> EntityResult<usize> {
        let Some(max) = self.settings.max_pool_size else {
            return Ok(0);
        };

        let evicted: Vec<(String, Arc<dyn Adapter>)> = {
            let mut entries = self.entries.lock();
            if entries.len() <= max {
                return Ok(0);
            }
            let mut order: Vec<(u64, String)> = entries
                .iter()
                .map(|(hash, entry)| (entry.last_used, hash.clone()))
                .collect();
            order.sort();
            let excess = entries.len() - max;
            order
                .into_iter()
                .take(excess)
                .filter_map(|(_, hash)| entries.remove(&hash).map(|e| (hash, e.adapter)))
                .collect()
        };

        for (hash, adapter) in &evicted {
            info!(tenant_hash = %hash, max_pool_size = max, "Evicting adapter");
            if let Err(e) = self.teardown(hash, adapter).await {
                warn!(tenant_hash = %hash, error = %e, "Evicted adapter failed to disconnect");
            }
        }
        Ok(evicted.len())
    }

    async fn teardown(&self, hash: &str, adapter: &Arc<dyn Adapter>) -> EntityResult<()> {
        let result = adapter.disconnect().await;
        for listener in &self.listeners {
            listener.adapter_disconnected(adapter, hash).await;
        }
        debug!(tenant_hash = %hash, "Adapter disconnected");
        result
    }

    /// Removes the adapter for `hash` from the pool and disconnects it.
    /// Returns `false` when nothing was pooled under `hash`.
    pub async fn disconnect(&self, hash: &str) -> EntityResult<bool> {
        let Some(entry) = self.entries.lock().remove(hash) else {
            return Ok(false);
        };
        self.teardown(hash, &entry.adapter).await?;
        info!(tenant_hash = %hash, "Adapter removed from pool");
        Ok(true)
    }

    /// Disconnects every pooled adapter. All adapters are torn down even if
    /// some fail; the first failure is returned.
    pub async fn shutdown(&self) -> EntityResult<()> {
        let drained: Vec<(String, PoolEntry)> = self.entries.lock().drain().collect();
        let count = drained.len();

        let mut first_error = None;
        for (hash, entry) in drained {
            if let Err(e) = self.teardown(&hash, &entry.adapter).await {
                warn!(tenant_hash = %hash, error = %e, "Adapter failed to disconnect");
                first_error.get_or_insert(e);
            }
        }

        info!(adapters = count, "Adapter pool shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the pooled hashes, least recently used first.
    pub fn pooled_hashes(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut order: Vec<(u64, &String)> = entries
            .iter()
            .map(|(hash, entry)| (entry.last_used, hash))
            .collect();
        order.sort();
        order.into_iter().map(|(_, hash)| hash.clone()).collect()
    }

    /// Returns when the adapter for `hash` was last handed out.
    pub fn last_used_at(&self, hash: &str) -> Option<Instant> {
        self.entries.lock().get(hash).map(|entry| entry.last_used_at)
    }

    /// Returns whether an adapter is pooled under `hash`.
    pub fn contains(&self, hash: &str) -> bool {
        self.entries.lock().contains_key(hash)
    }

    /// Returns the number of pooled adapters.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is pooled.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
