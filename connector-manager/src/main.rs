use anyhow::{Context, Result};
use conduit::config::{load_config, ConduitConfig};
use conduit::credentials::SecretVault;
use conduit::rate_limit::RateLimiter;
use connector_manager::{AdapterContext, ConnectorService, SqliteConnectorStore};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connector_manager=info,conduit=info".into()),
        )
        .init();

    info!("Connector Manager starting...");

    // File config when CONDUIT_CONFIG is set, env overrides either way
    let settings = match std::env::var("CONDUIT_CONFIG") {
        Ok(path) => {
            let mut settings = load_config(&path)?;
            settings.apply_env();
            info!(path = %path, "Configuration loaded from file");
            settings
        }
        Err(_) => ConduitConfig::from_env(),
    };

    info!(
        storage = %settings.storage.path,
        request_timeout_secs = settings.http.request_timeout_secs,
        retry_max_attempts = settings.retry.max_attempts,
        max_limit = settings.query.max_limit,
        "Configuration loaded"
    );

    let vault = SecretVault::from_env(&settings.vault)
        .with_context(|| format!("{} must hold the master secret", settings.vault.secret_env))?;
    info!(key_version = %vault.key_version(), "Secret vault initialized");

    let store = SqliteConnectorStore::new(&settings.storage.path)
        .context("Failed to initialize connector store")?;
    info!("Connector store initialized");

    let ctx = AdapterContext::new(
        Arc::new(vault),
        Arc::new(RateLimiter::new()),
        Arc::new(settings),
    );
    let service = ConnectorService::new(Arc::new(store), ctx);
    info!("Connector service ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    let failures = service.dispose_all().await;
    if failures > 0 {
        warn!(failures, "Some connectors failed to dispose cleanly");
    }
    info!("Connector manager stopped");

    Ok(())
}
