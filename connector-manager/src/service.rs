//! Connector service - the single entry point for callers.
//!
//! Owns CRUD over persisted configurations, routes data calls through the
//! registry's cached instances, and records the audit, query-log and
//! statistics side effects of every call.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use conduit::{ConnectorError, Result};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connectors::AdapterContext;
use crate::registry::{ConnectorFactory, ConnectorRegistry, RegistryEntry};
use crate::schema::Schema;
use crate::store::ConnectorStore;
use crate::types::{
    Action, ActionResult, AuditAction, AuditLogEntry, ConnectorConfig, ConnectorCredentials,
    ConnectorStats, ConnectorStatus, ConnectorType, ConnectorUpdate, HealthStatus, NewConnector,
    PersistedStats, QueryLogEntry, QueryParams, QueryResult, TestResult,
};

/// Health checks run at most this many at a time.
const HEALTH_CHECK_CONCURRENCY: usize = 8;

pub struct ConnectorService {
    store: Arc<dyn ConnectorStore>,
    registry: ConnectorRegistry,
}

impl ConnectorService {
    pub fn new(store: Arc<dyn ConnectorStore>, ctx: AdapterContext) -> Self {
        Self {
            store,
            registry: ConnectorRegistry::new(ctx),
        }
    }

    /// Same as [`ConnectorService::new`] with a custom instance factory.
    pub fn with_factory(
        store: Arc<dyn ConnectorStore>,
        ctx: AdapterContext,
        factory: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self {
            store,
            registry: ConnectorRegistry::with_factory(ctx, factory),
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    fn ctx(&self) -> &AdapterContext {
        self.registry.context()
    }

    // ── CRUD ─────────────────────────────────────────────────────────────────

    /// Persists a new connector and eagerly tests it.
    ///
    /// A failed test leaves the connector in `ERROR` status; creation itself
    /// still succeeds.
    pub async fn create_connector(&self, organization_id: &str, input: NewConnector) -> Result<ConnectorConfig> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ConnectorError::Validation("connector name is required".into()));
        }
        if matches!(input.connector_type, ConnectorType::Saas | ConnectorType::File) {
            return Err(ConnectorError::Validation(format!(
                "connector type {} is not supported",
                input.connector_type.as_str()
            )));
        }
        if let Some(rate_limit) = &input.rate_limit {
            rate_limit.validate()?;
        }
        let slug = slugify(name)?;
        self.ensure_slug_free(organization_id, &slug, None).await?;

        let now = Utc::now();
        let config = ConnectorConfig {
            id: Uuid::now_v7().to_string(),
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            slug,
            connector_type: input.connector_type,
            provider: input
                .provider
                .unwrap_or_else(|| default_provider(input.connector_type).to_string()),
            description: input.description,
            options: input.options,
            credentials: ConnectorCredentials::Encrypted(
                self.ctx().vault.encrypt_structured(&input.credentials)?,
            ),
            rate_limit: input.rate_limit,
            status: ConnectorStatus::Pending,
            last_tested_at: None,
            last_error: None,
            stats: PersistedStats::default(),
            created_at: now,
            updated_at: now,
        };
        self.store.save_config(&config).await?;
        info!(
            connector_id = %config.id,
            slug = %config.slug,
            connector_type = config.connector_type.as_str(),
            "Connector created"
        );
        self.audit(
            &config,
            AuditAction::ConnectorCreated,
            json!({
                "name": config.name,
                "slug": config.slug,
                "type": config.connector_type.as_str(),
                "provider": config.provider,
            }),
        )
        .await;

        let (config, _) = self.run_test(config).await?;
        Ok(config)
    }

    pub async fn list_connectors(&self, organization_id: &str) -> Result<Vec<ConnectorConfig>> {
        self.store.list_configs(organization_id).await
    }

    pub async fn get_connector(&self, id: &str) -> Result<ConnectorConfig> {
        self.store
            .load_config(id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("connector {}", id)))
    }

    /// Applies `update`. Changes to options, credentials or rate limits evict
    /// the live instance and reset status to `PENDING`.
    pub async fn update_connector(&self, id: &str, update: ConnectorUpdate) -> Result<ConnectorConfig> {
        let mut config = self.get_connector(id).await?;
        let mut changed: Vec<&str> = Vec::new();

        if let Some(name) = &update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConnectorError::Validation("connector name is required".into()));
            }
            let slug = slugify(name)?;
            if slug != config.slug {
                self.ensure_slug_free(&config.organization_id, &slug, Some(id)).await?;
                config.slug = slug;
            }
            config.name = name.to_string();
            changed.push("name");
        }
        if let Some(description) = update.description.clone() {
            config.description = Some(description);
            changed.push("description");
        }
        if let Some(options) = update.options.clone() {
            config.options = options;
            changed.push("options");
        }
        if let Some(credentials) = &update.credentials {
            config.credentials =
                ConnectorCredentials::Encrypted(self.ctx().vault.encrypt_structured(credentials)?);
            changed.push("credentials");
        }
        if let Some(rate_limit) = update.rate_limit.clone() {
            rate_limit.validate()?;
            config.rate_limit = Some(rate_limit);
            changed.push("rateLimit");
        }

        if update.touches_runtime() {
            config.status = ConnectorStatus::Pending;
        }
        config.updated_at = Utc::now();
        self.store.save_config(&config).await?;

        if update.touches_runtime() {
            self.registry.evict(id).await;
            self.ctx().limiter.reset(id);
        }
        info!(connector_id = %id, fields = ?changed, "Connector updated");
        self.audit(&config, AuditAction::ConnectorUpdated, json!({ "fields": changed }))
            .await;
        Ok(config)
    }

    pub async fn delete_connector(&self, id: &str) -> Result<()> {
        let config = self.get_connector(id).await?;
        // Row first: a concurrent first use then either finds nothing to
        // load or caches an instance this eviction removes.
        self.store.delete_config(id).await?;
        self.registry.evict(id).await;
        self.ctx().limiter.reset(id);
        info!(connector_id = %id, "Connector deleted");
        self.audit(&config, AuditAction::ConnectorDeleted, json!({ "slug": config.slug }))
            .await;
        Ok(())
    }

    // ── Data access ──────────────────────────────────────────────────────────

    /// Tests connectivity and records the outcome as the connector's status.
    pub async fn test_connector(&self, id: &str) -> Result<TestResult> {
        let config = self.get_connector(id).await?;
        let (_, result) = self.run_test(config).await?;
        Ok(result)
    }

    pub async fn get_connector_schema(&self, id: &str) -> Result<Schema> {
        let config = self.get_connector(id).await?;
        let entry = self.instance(&config.id).await?;
        let result = entry.instance.get_schema().await;
        entry.record(result.is_ok());
        result
    }

    pub async fn query_connector(&self, id: &str, params: &QueryParams) -> Result<QueryResult> {
        let config = self.get_connector(id).await?;
        let operation = format!("query:{}", params.operation.as_str());
        self.call(
            &config,
            &operation,
            &params.resource,
            |entry| async move { entry.instance.query(params).await },
            |result: &QueryResult| result.rows.len() as u64,
        )
        .await
    }

    pub async fn execute_action(&self, id: &str, action: &Action) -> Result<ActionResult> {
        let config = self.get_connector(id).await?;
        let operation = format!("execute:{}", action.kind.as_str());
        self.call(
            &config,
            &operation,
            &action.resource,
            |entry| async move { entry.instance.execute(action).await },
            |result: &ActionResult| result.affected_rows,
        )
        .await
    }

    /// Runs `actions` all-or-nothing. Only database connectors support this.
    pub async fn execute_transaction(&self, id: &str, actions: &[Action]) -> Result<Vec<ActionResult>> {
        let config = self.get_connector(id).await?;
        let resources: Vec<&str> = actions.iter().map(|a| a.resource.as_str()).collect();
        let resource = resources.join(",");
        self.call(
            &config,
            "transaction",
            &resource,
            |entry| async move { entry.instance.execute_transaction(actions).await },
            |results: &Vec<ActionResult>| results.iter().map(|r| r.affected_rows).sum(),
        )
        .await
    }

    // ── Statistics and health ────────────────────────────────────────────────

    /// Persisted counters combined with the live instance's counters when cached.
    pub async fn get_connector_stats(&self, id: &str) -> Result<ConnectorStats> {
        let config = self.get_connector(id).await?;
        let entry = self.registry.get(id);
        let persisted = config.stats.clone();
        let error_rate = if persisted.request_count == 0 {
            0.0
        } else {
            persisted.error_count as f64 / persisted.request_count as f64
        };

        Ok(ConnectorStats {
            connector_id: config.id,
            status: config.status,
            cached: entry.is_some(),
            instance: entry.as_ref().map(|e| e.instance.stats()),
            instance_created_at: entry.as_ref().map(|e| e.created_at),
            last_used_at: entry.as_ref().map(|e| e.last_used()),
            persisted,
            error_rate,
        })
    }

    /// Checks every cached instance concurrently. Sorted by connector id.
    pub async fn health_check_all(&self) -> Vec<(String, HealthStatus)> {
        let mut statuses: Vec<(String, HealthStatus)> = stream::iter(self.registry.cached())
            .map(|entry| async move {
                let status = entry.instance.health_status().await;
                (entry.connector_id().to_string(), status)
            })
            .buffer_unordered(HEALTH_CHECK_CONCURRENCY)
            .collect()
            .await;
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Disposes every cached instance. Returns the number of dispose failures.
    pub async fn dispose_all(&self) -> usize {
        self.registry.dispose_all().await
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn ensure_slug_free(&self, organization_id: &str, slug: &str, except_id: Option<&str>) -> Result<()> {
        match self.store.find_by_slug(organization_id, slug).await? {
            Some(existing) if Some(existing.id.as_str()) != except_id => Err(ConnectorError::Conflict(
                format!("connector with slug '{}' already exists", slug),
            )),
            _ => Ok(()),
        }
    }

    /// Cached instance for `id`, built from the stored configuration on first use.
    async fn instance(&self, id: &str) -> Result<Arc<RegistryEntry>> {
        self.registry.get_or_load(id, || self.get_connector(id)).await
    }

    /// Initializes (if needed) and tests the instance, then persists the
    /// outcome as status, `last_tested_at` and `last_error`.
    async fn run_test(&self, config: ConnectorConfig) -> Result<(ConnectorConfig, TestResult)> {
        let started = Instant::now();
        let outcome = match self.instance(&config.id).await {
            Ok(entry) => {
                let result = entry.instance.test().await;
                entry.record(matches!(result, Ok(TestResult { success: true, .. })));
                result
            }
            Err(e) => Err(e),
        };
        // A denied call tells nothing about the backend, so status stays put
        let result = match outcome {
            Ok(result) => result,
            Err(e @ ConnectorError::RateLimitExceeded { .. }) => return Err(e),
            Err(e) => TestResult {
                success: false,
                message: e.to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
            },
        };

        // Outcome lands on the latest row so edits made during the test survive
        let mut config = match self.store.load_config(&config.id).await? {
            Some(latest) => latest,
            None => {
                debug!(connector_id = %config.id, "Connector deleted during test");
                return Ok((config, result));
            }
        };
        let now = Utc::now();
        config.last_tested_at = Some(now);
        config.updated_at = now;
        if result.success {
            config.status = ConnectorStatus::Active;
            config.last_error = None;
            info!(connector_id = %config.id, latency_ms = result.latency_ms, "Connector test passed");
        } else {
            config.status = ConnectorStatus::Error;
            config.last_error = Some(result.message.clone());
            warn!(connector_id = %config.id, error = %result.message, "Connector test failed");
        }
        self.store.save_config(&config).await?;
        self.audit(
            &config,
            AuditAction::ConnectorTested,
            json!({
                "success": result.success,
                "latencyMs": result.latency_ms,
                "message": result.message,
            }),
        )
        .await;
        Ok((config, result))
    }

    /// Routes one data call and records its query log and statistics.
    ///
    /// The caller always receives the adapter's own result; side-effect
    /// failures are only logged.
    async fn call<T, F, Fut, C>(
        &self,
        config: &ConnectorConfig,
        operation: &str,
        resource: &str,
        op: F,
        count: C,
    ) -> Result<T>
    where
        F: FnOnce(Arc<RegistryEntry>) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: FnOnce(&T) -> u64,
    {
        let started = Instant::now();
        let result = match self.instance(&config.id).await {
            Ok(entry) => {
                let result = op(Arc::clone(&entry)).await;
                entry.record(result.is_ok());
                result
            }
            Err(e) => Err(e),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let entry = QueryLogEntry {
            id: Uuid::now_v7().to_string(),
            connector_id: config.id.clone(),
            organization_id: config.organization_id.clone(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            duration_ms,
            row_count: result.as_ref().ok().map(count),
            success: result.is_ok(),
            error_kind: result.as_ref().err().map(ConnectorError::kind),
            error_message: result.as_ref().err().map(ToString::to_string),
            created_at: Utc::now(),
        };
        match &result {
            Ok(_) => debug!(
                connector_id = %config.id,
                operation,
                resource,
                duration_ms,
                "Connector call succeeded"
            ),
            Err(e) => warn!(
                connector_id = %config.id,
                operation,
                resource,
                duration_ms,
                error_kind = %e.kind(),
                error = %e,
                "Connector call failed"
            ),
        }

        if let Err(e) = self.store.append_query_log(&entry).await {
            warn!(connector_id = %config.id, error = %e, "Failed to append query log");
        }
        if let Err(e) = self
            .store
            .increment_stats(&config.id, duration_ms, result.is_err())
            .await
        {
            warn!(connector_id = %config.id, error = %e, "Failed to update connector stats");
        }
        result
    }

    async fn audit(&self, config: &ConnectorConfig, action: AuditAction, details: Value) {
        let entry = AuditLogEntry {
            id: Uuid::now_v7().to_string(),
            organization_id: config.organization_id.clone(),
            connector_id: config.id.clone(),
            action,
            details,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_audit_log(&entry).await {
            warn!(connector_id = %config.id, action = action.as_str(), error = %e, "Failed to append audit log");
        }
    }
}

fn default_provider(connector_type: ConnectorType) -> &'static str {
    match connector_type {
        ConnectorType::Database => "postgres",
        ConnectorType::Api => "rest",
        ConnectorType::Saas => "saas",
        ConnectorType::File => "file",
    }
}

/// URL-safe slug: lowercase ASCII alphanumerics, other runs collapse to `-`.
pub fn slugify(name: &str) -> Result<String> {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        return Err(ConnectorError::Validation(format!(
            "name '{}' does not produce a usable slug",
            name
        )));
    }
    Ok(slug)
}
