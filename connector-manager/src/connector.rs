use async_trait::async_trait;
use conduit::{ConnectorError, Result};

use crate::schema::Schema;
use crate::types::{
    Action, ActionResult, ConnectorConfig, ConnectorType, HealthStatus, InstanceStats, QueryParams,
    QueryResult, TestResult,
};

/// Uniform contract every backend adapter implements.
///
/// Instances are shared behind `Arc` and accept concurrent data calls.
/// `initialize` and `dispose` are exclusive with each other and with
/// in-flight data calls on the same instance.
///
/// # Lifecycle
/// 1. The registry constructs the adapter for one configuration
/// 2. `initialize(config)` decrypts credentials, builds the backend client
///    and checks connectivity
/// 3. Data calls (`query`, `execute`, `get_schema`, `test`)
/// 4. `dispose()` releases the client
///
/// Data calls before a successful `initialize` or after `dispose` fail with
/// [`ConnectorError::NotInitialized`].
///
/// # Example
/// ```no_run
/// use connector_manager::{Connector, QueryParams};
/// use conduit::Result;
///
/// async fn first_orders(connector: &dyn Connector) -> Result<usize> {
///     let result = connector.query(&QueryParams::read("orders").with_limit(10)).await?;
///     Ok(result.rows.len())
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend family, fixed at construction.
    fn connector_type(&self) -> ConnectorType;

    /// ID of the configuration this instance is bound to.
    fn connector_id(&self) -> &str;

    /// Establishes the backend client. Re-initializing replaces the client.
    async fn initialize(&self, config: &ConnectorConfig) -> Result<()>;

    /// Releases the backend client. Idempotent.
    async fn dispose(&self) -> Result<()>;

    async fn is_initialized(&self) -> bool;

    /// Runs a cheap connectivity check against the backend.
    async fn test(&self) -> Result<TestResult>;

    async fn query(&self, params: &QueryParams) -> Result<QueryResult>;

    async fn execute(&self, action: &Action) -> Result<ActionResult>;

    /// Runs `actions` all-or-nothing.
    ///
    /// Backends without transactions reject with `Validation`.
    async fn execute_transaction(&self, _actions: &[Action]) -> Result<Vec<ActionResult>> {
        Err(ConnectorError::Validation(format!(
            "{} connectors do not support transactions",
            self.connector_type().as_str()
        )))
    }

    async fn get_schema(&self) -> Result<Schema>;

    /// Never fails; problems are reported in the returned status.
    async fn health_status(&self) -> HealthStatus;

    /// In-memory counters for this instance.
    fn stats(&self) -> InstanceStats;
}
