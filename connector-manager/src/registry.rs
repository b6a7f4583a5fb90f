//! Connector registry - Caches one live instance per connector configuration.
//!
//! The registry is the only process-wide index of instances. Creation of an
//! instance, its eviction and [`ConnectorRegistry::dispose_all`] are serialized
//! per connector id, so an instance is never initialized and disposed at the
//! same time and at most one live instance exists per id.
//!
//! Callers backed by a store use [`ConnectorRegistry::get_or_load`], which
//! reads the configuration under the gate. A configuration change is saved
//! before the matching eviction, so an instance built from an outdated copy
//! can never outlive that eviction.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use conduit::Result;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::connectors::{build_connector, AdapterContext};
use crate::types::ConnectorConfig;

/// Constructs (uninitialized) instances for configurations.
pub trait ConnectorFactory: Send + Sync {
    fn build(&self, config: &ConnectorConfig, ctx: AdapterContext) -> Result<Arc<dyn Connector>>;
}

/// Picks the database or API adapter by connector type.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdapterFactory;

impl ConnectorFactory for AdapterFactory {
    fn build(&self, config: &ConnectorConfig, ctx: AdapterContext) -> Result<Arc<dyn Connector>> {
        build_connector(config, ctx)
    }
}

/// A cached, initialized instance and its usage counters.
pub struct RegistryEntry {
    pub instance: Arc<dyn Connector>,
    pub created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl RegistryEntry {
    fn new(instance: Arc<dyn Connector>) -> Self {
        let now = Utc::now();
        Self {
            instance,
            created_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn connector_id(&self) -> &str {
        self.instance.connector_id()
    }

    /// Records one call routed through this entry.
    pub fn record(&self, succeeded: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_used_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

pub struct ConnectorRegistry {
    entries: DashMap<String, Arc<RegistryEntry>>,
    /// Per-id gate around initialize and dispose.
    gates: DashMap<String, Arc<Mutex<()>>>,
    factory: Arc<dyn ConnectorFactory>,
    ctx: AdapterContext,
}

impl ConnectorRegistry {
    pub fn new(ctx: AdapterContext) -> Self {
        Self::with_factory(ctx, Arc::new(AdapterFactory))
    }

    pub fn with_factory(ctx: AdapterContext, factory: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            entries: DashMap::new(),
            gates: DashMap::new(),
            factory,
            ctx,
        }
    }

    pub fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    /// Cached entry for `id`, if any.
    pub fn get(&self, id: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Returns the cached instance for `config`, creating and initializing one
    /// on first use.
    ///
    /// The instance is built from `config` as given. A failed `initialize`
    /// leaves nothing cached.
    pub async fn get_or_create(&self, config: &ConnectorConfig) -> Result<Arc<RegistryEntry>> {
        self.get_or_load(&config.id, || async { Ok(config.clone()) })
            .await
    }

    /// Returns the cached instance for `id`, or builds one from the
    /// configuration `load` returns.
    ///
    /// `load` runs while the id's gate is held, so it observes every change
    /// whose eviction has already completed.
    pub async fn get_or_load<F, Fut>(&self, id: &str, load: F) -> Result<Arc<RegistryEntry>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConnectorConfig>>,
    {
        if let Some(entry) = self.get(id) {
            return Ok(entry);
        }

        let gate = self.gate(id);
        let _held = gate.lock().await;

        // Another caller may have finished while we waited
        if let Some(entry) = self.get(id) {
            return Ok(entry);
        }

        let config = load().await?;
        let instance = self.factory.build(&config, self.ctx.clone())?;
        instance.initialize(&config).await?;

        let entry = Arc::new(RegistryEntry::new(instance));
        self.entries.insert(id.to_string(), Arc::clone(&entry));
        info!(
            connector_id = %config.id,
            connector_type = config.connector_type.as_str(),
            "Connector instance created"
        );
        Ok(entry)
    }

    /// Removes and disposes the cached instance for `id`.
    ///
    /// Returns whether an instance was cached. Dispose failures are logged.
    pub async fn evict(&self, id: &str) -> bool {
        let gate = self.gate(id);
        let _held = gate.lock().await;

        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        if let Err(e) = entry.instance.dispose().await {
            warn!(connector_id = %id, error = %e, "Failed to dispose evicted connector");
        } else {
            debug!(connector_id = %id, "Connector instance evicted");
        }
        true
    }

    /// Disposes every cached instance. Individual failures do not stop the sweep.
    ///
    /// Returns the number of instances that failed to dispose.
    pub async fn dispose_all(&self) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut failures = 0;

        for id in &ids {
            let gate = self.gate(id);
            let _held = gate.lock().await;

            let Some((_, entry)) = self.entries.remove(id) else {
                continue;
            };
            if let Err(e) = entry.instance.dispose().await {
                failures += 1;
                warn!(connector_id = %id, error = %e, "Failed to dispose connector");
            }
        }

        info!(disposed = ids.len() - failures, failures, "Disposed cached connectors");
        failures
    }

    /// Snapshot of all cached entries.
    pub fn cached(&self) -> Vec<Arc<RegistryEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn gate(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.gates
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}
