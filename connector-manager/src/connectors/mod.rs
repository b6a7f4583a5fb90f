//! Backend adapters and the factory that picks one per configuration.

pub mod api;
pub mod database;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conduit::config::ConduitConfig;
use conduit::credentials::SecretVault;
use conduit::rate_limit::RateLimiter;
use conduit::{ConnectorError, Result};
use serde_json::{Map, Value};

use crate::connector::Connector;
use crate::types::{ConnectorConfig, ConnectorCredentials, ConnectorType};

pub use api::ApiConnector;
pub use database::DatabaseConnector;

/// Shared collaborators handed to every adapter.
#[derive(Clone)]
pub struct AdapterContext {
    pub vault: Arc<SecretVault>,
    pub limiter: Arc<RateLimiter>,
    pub settings: Arc<ConduitConfig>,
}

impl AdapterContext {
    pub fn new(vault: Arc<SecretVault>, limiter: Arc<RateLimiter>, settings: Arc<ConduitConfig>) -> Self {
        Self {
            vault,
            limiter,
            settings,
        }
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.settings.http.request_timeout()
    }
}

/// Constructs the adapter for `config`. SAAS and FILE have no adapter.
///
/// The returned instance is not initialized.
pub fn build_connector(config: &ConnectorConfig, ctx: AdapterContext) -> Result<Arc<dyn Connector>> {
    match config.connector_type {
        ConnectorType::Database => Ok(Arc::new(DatabaseConnector::new(&config.id, ctx))),
        ConnectorType::Api => Ok(Arc::new(ApiConnector::new(&config.id, ctx)?)),
        other => Err(ConnectorError::Validation(format!(
            "connector type {} is not supported",
            other.as_str()
        ))),
    }
}

/// Decrypts the credential map of `config`.
pub(crate) fn open_credentials(vault: &SecretVault, config: &ConnectorConfig) -> Result<Map<String, Value>> {
    match &config.credentials {
        ConnectorCredentials::Encrypted(blob) => vault.decrypt_structured(blob),
        ConnectorCredentials::Plain(map) => Ok(map.clone()),
    }
}

/// Checks the configuration handed to `initialize` belongs to this instance.
pub(crate) fn check_binding(id: &str, expected: ConnectorType, config: &ConnectorConfig) -> Result<()> {
    if config.id != id {
        return Err(ConnectorError::Validation(format!(
            "instance bound to {} cannot be initialized with {}",
            id, config.id
        )));
    }
    if config.connector_type != expected {
        return Err(ConnectorError::Validation(format!(
            "expected a {} configuration, got {}",
            expected.as_str(),
            config.connector_type.as_str()
        )));
    }
    Ok(())
}

/// Bounds one backend call by `timeout`.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::ConnectionTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

pub(crate) fn not_initialized(id: &str) -> ConnectorError {
    ConnectorError::NotInitialized(format!("connector {} is not initialized", id))
}

/// First string found under any of `keys`.
pub(crate) fn first_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}
