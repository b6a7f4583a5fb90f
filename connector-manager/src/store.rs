//! Persistence collaborator: connector configuration rows, usage counters,
//! query log and audit log.
//!
//! Two implementations:
//! - [`MemoryConnectorStore`] keeps everything in process (tests, embedding)
//! - [`SqliteConnectorStore`] persists to a SQLite file
//!
//! Both reject configurations whose credentials are not encrypted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit::{ConnectorError, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{
    AuditLogEntry, ConnectorConfig, ConnectorCredentials, PersistedStats, QueryLogEntry,
};

#[async_trait]
pub trait ConnectorStore: Send + Sync {
    async fn load_config(&self, id: &str) -> Result<Option<ConnectorConfig>>;

    /// Inserts or replaces a configuration. Plaintext credentials are rejected.
    ///
    /// Usage counters of an existing row are left untouched.
    async fn save_config(&self, config: &ConnectorConfig) -> Result<()>;

    /// Returns whether a row was removed.
    async fn delete_config(&self, id: &str) -> Result<bool>;

    async fn list_configs(&self, organization_id: &str) -> Result<Vec<ConnectorConfig>>;

    async fn find_by_slug(&self, organization_id: &str, slug: &str) -> Result<Option<ConnectorConfig>>;

    /// Folds one request into the persisted counters and moving-average latency.
    async fn increment_stats(&self, id: &str, duration_ms: u64, is_error: bool) -> Result<()>;

    async fn append_query_log(&self, entry: &QueryLogEntry) -> Result<()>;

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> Result<()>;
}

fn reject_plaintext(config: &ConnectorConfig) -> Result<()> {
    if !config.credentials.is_encrypted() {
        return Err(ConnectorError::Validation(format!(
            "refusing to persist plaintext credentials for connector {}",
            config.id
        )));
    }
    Ok(())
}

fn storage_err(e: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Storage(e.to_string())
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    configs: HashMap<String, ConnectorConfig>,
    query_log: Vec<QueryLogEntry>,
    audit_log: Vec<AuditLogEntry>,
}

#[derive(Default)]
pub struct MemoryConnectorStore {
    state: Mutex<MemoryState>,
}

impl MemoryConnectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_log(&self) -> Vec<QueryLogEntry> {
        self.lock().query_log.clone()
    }

    pub fn audit_log(&self) -> Vec<AuditLogEntry> {
        self.lock().audit_log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ConnectorStore for MemoryConnectorStore {
    async fn load_config(&self, id: &str) -> Result<Option<ConnectorConfig>> {
        Ok(self.lock().configs.get(id).cloned())
    }

    async fn save_config(&self, config: &ConnectorConfig) -> Result<()> {
        reject_plaintext(config)?;
        let mut state = self.lock();
        let taken = state.configs.values().any(|c| {
            c.id != config.id && c.organization_id == config.organization_id && c.slug == config.slug
        });
        if taken {
            return Err(ConnectorError::Conflict(format!(
                "slug '{}' already exists in organization {}",
                config.slug, config.organization_id
            )));
        }
        // Counters belong to increment_stats; an existing row keeps its own
        let mut row = config.clone();
        if let Some(existing) = state.configs.get(&config.id) {
            row.stats = existing.stats.clone();
        }
        state.configs.insert(row.id.clone(), row);
        Ok(())
    }

    async fn delete_config(&self, id: &str) -> Result<bool> {
        Ok(self.lock().configs.remove(id).is_some())
    }

    async fn list_configs(&self, organization_id: &str) -> Result<Vec<ConnectorConfig>> {
        let mut configs: Vec<ConnectorConfig> = self
            .lock()
            .configs
            .values()
            .filter(|c| c.organization_id == organization_id)
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(configs)
    }

    async fn find_by_slug(&self, organization_id: &str, slug: &str) -> Result<Option<ConnectorConfig>> {
        Ok(self
            .lock()
            .configs
            .values()
            .find(|c| c.organization_id == organization_id && c.slug == slug)
            .cloned())
    }

    async fn increment_stats(&self, id: &str, duration_ms: u64, is_error: bool) -> Result<()> {
        let mut state = self.lock();
        let config = state
            .configs
            .get_mut(id)
            .ok_or_else(|| ConnectorError::NotFound(format!("connector {}", id)))?;
        config.stats.record(duration_ms, is_error);
        Ok(())
    }

    async fn append_query_log(&self, entry: &QueryLogEntry) -> Result<()> {
        self.lock().query_log.push(entry.clone());
        Ok(())
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> Result<()> {
        self.lock().audit_log.push(entry.clone());
        Ok(())
    }
}

// ── SQLite ───────────────────────────────────────────────────────────────────

const CONFIG_COLUMNS: &str = "id, organization_id, name, slug, connector_type, provider, description,
     options_json, credentials, rate_limit_json, status, last_tested_at, last_error,
     request_count, error_count, avg_latency_ms, created_at, updated_at";

/// Persists connector configurations in SQLite.
pub struct SqliteConnectorStore {
    conn: Mutex<Connection>,
}

impl SqliteConnectorStore {
    /// Opens (or creates) the database and ensures the tables exist.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| ConnectorError::Storage(format!("failed to open {}: {}", db_path, e)))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        self.lock()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS connectors (
                    id               TEXT PRIMARY KEY,
                    organization_id  TEXT NOT NULL,
                    name             TEXT NOT NULL,
                    slug             TEXT NOT NULL,
                    connector_type   TEXT NOT NULL,
                    provider         TEXT NOT NULL,
                    description      TEXT,
                    options_json     TEXT NOT NULL,
                    credentials      TEXT NOT NULL,
                    rate_limit_json  TEXT,
                    status           TEXT NOT NULL,
                    last_tested_at   TEXT,
                    last_error       TEXT,
                    request_count    INTEGER NOT NULL DEFAULT 0,
                    error_count      INTEGER NOT NULL DEFAULT 0,
                    avg_latency_ms   REAL NOT NULL DEFAULT 0,
                    created_at       TEXT NOT NULL,
                    updated_at       TEXT NOT NULL,
                    UNIQUE (organization_id, slug)
                );
                CREATE TABLE IF NOT EXISTS query_log (
                    id               TEXT PRIMARY KEY,
                    connector_id     TEXT NOT NULL,
                    organization_id  TEXT NOT NULL,
                    operation        TEXT NOT NULL,
                    resource         TEXT NOT NULL,
                    duration_ms      INTEGER NOT NULL,
                    row_count        INTEGER,
                    success          INTEGER NOT NULL,
                    error_kind       TEXT,
                    error_message    TEXT,
                    created_at       TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_query_log_connector ON query_log (connector_id);
                CREATE TABLE IF NOT EXISTS audit_log (
                    id               TEXT PRIMARY KEY,
                    organization_id  TEXT NOT NULL,
                    connector_id     TEXT NOT NULL,
                    action           TEXT NOT NULL,
                    details_json     TEXT NOT NULL,
                    created_at       TEXT NOT NULL
                );",
            )
            .map_err(|e| ConnectorError::Storage(format!("failed to create tables: {}", e)))
    }

    /// Number of query-log rows recorded for `connector_id`.
    pub fn query_log_count(&self, connector_id: &str) -> Result<u64> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM query_log WHERE connector_id = ?1",
                params![connector_id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    pub fn audit_actions(&self, connector_id: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT action FROM audit_log WHERE connector_id = ?1 ORDER BY rowid")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![connector_id], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)
    }

    fn select_one(&self, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<ConnectorConfig>> {
        let conn = self.lock();
        let sql = format!("SELECT {} FROM connectors WHERE {}", CONFIG_COLUMNS, where_clause);
        let raw = conn
            .query_row(&sql, args, StoredRow::from_row)
            .optional()
            .map_err(storage_err)?;
        raw.map(StoredRow::into_config).transpose()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Column values as stored, before parsing.
struct StoredRow {
    id: String,
    organization_id: String,
    name: String,
    slug: String,
    connector_type: String,
    provider: String,
    description: Option<String>,
    options_json: String,
    credentials: String,
    rate_limit_json: Option<String>,
    status: String,
    last_tested_at: Option<String>,
    last_error: Option<String>,
    request_count: i64,
    error_count: i64,
    avg_latency_ms: f64,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            slug: row.get(3)?,
            connector_type: row.get(4)?,
            provider: row.get(5)?,
            description: row.get(6)?,
            options_json: row.get(7)?,
            credentials: row.get(8)?,
            rate_limit_json: row.get(9)?,
            status: row.get(10)?,
            last_tested_at: row.get(11)?,
            last_error: row.get(12)?,
            request_count: row.get(13)?,
            error_count: row.get(14)?,
            avg_latency_ms: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_config(self) -> Result<ConnectorConfig> {
        let rate_limit = match self.rate_limit_json {
            Some(json) => Some(serde_json::from_str(&json).map_err(storage_err)?),
            None => None,
        };
        Ok(ConnectorConfig {
            connector_type: self.connector_type.parse()?,
            status: self.status.parse()?,
            options: serde_json::from_str(&self.options_json).map_err(storage_err)?,
            credentials: ConnectorCredentials::Encrypted(self.credentials),
            rate_limit,
            last_tested_at: self.last_tested_at.as_deref().map(parse_time).transpose()?,
            stats: PersistedStats {
                request_count: self.request_count as u64,
                error_count: self.error_count as u64,
                avg_latency_ms: self.avg_latency_ms,
            },
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
            slug: self.slug,
            provider: self.provider,
            description: self.description,
            last_error: self.last_error,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConnectorError::Storage(format!("bad timestamp '{}': {}", s, e)))
}

#[async_trait]
impl ConnectorStore for SqliteConnectorStore {
    async fn load_config(&self, id: &str) -> Result<Option<ConnectorConfig>> {
        self.select_one("id = ?1", &[&id])
    }

    async fn save_config(&self, config: &ConnectorConfig) -> Result<()> {
        reject_plaintext(config)?;
        let ConnectorCredentials::Encrypted(blob) = &config.credentials else {
            return Err(ConnectorError::Validation("credentials are not encrypted".into()));
        };
        let options_json = serde_json::to_string(&config.options).map_err(storage_err)?;
        let rate_limit_json = config
            .rate_limit
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(storage_err)?;

        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO connectors
                (id, organization_id, name, slug, connector_type, provider, description,
                 options_json, credentials, rate_limit_json, status, last_tested_at, last_error,
                 request_count, error_count, avg_latency_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(id) DO UPDATE SET
                organization_id = excluded.organization_id,
                name            = excluded.name,
                slug            = excluded.slug,
                connector_type  = excluded.connector_type,
                provider        = excluded.provider,
                description     = excluded.description,
                options_json    = excluded.options_json,
                credentials     = excluded.credentials,
                rate_limit_json = excluded.rate_limit_json,
                status          = excluded.status,
                last_tested_at  = excluded.last_tested_at,
                last_error      = excluded.last_error,
                updated_at      = excluded.updated_at",
            params![
                config.id,
                config.organization_id,
                config.name,
                config.slug,
                config.connector_type.as_str(),
                config.provider,
                config.description,
                options_json,
                blob,
                rate_limit_json,
                config.status.as_str(),
                config.last_tested_at.map(|t| t.to_rfc3339()),
                config.last_error,
                config.stats.request_count as i64,
                config.stats.error_count as i64,
                config.stats.avg_latency_ms,
                config.created_at.to_rfc3339(),
                config.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ConnectorError::Conflict(format!(
                    "slug '{}' already exists in organization {}",
                    config.slug, config.organization_id
                )))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn delete_config(&self, id: &str) -> Result<bool> {
        let removed = self
            .lock()
            .execute("DELETE FROM connectors WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(removed > 0)
    }

    async fn list_configs(&self, organization_id: &str) -> Result<Vec<ConnectorConfig>> {
        let raw = {
            let conn = self.lock();
            let sql = format!(
                "SELECT {} FROM connectors WHERE organization_id = ?1 ORDER BY created_at, id",
                CONFIG_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(params![organization_id], StoredRow::from_row)
                .map_err(storage_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(storage_err)?
        };
        raw.into_iter().map(StoredRow::into_config).collect()
    }

    async fn find_by_slug(&self, organization_id: &str, slug: &str) -> Result<Option<ConnectorConfig>> {
        self.select_one("organization_id = ?1 AND slug = ?2", &[&organization_id, &slug])
    }

    async fn increment_stats(&self, id: &str, duration_ms: u64, is_error: bool) -> Result<()> {
        // Single statement, so concurrent increments cannot interleave
        let updated = self
            .lock()
            .execute(
                "UPDATE connectors SET
                    avg_latency_ms = (avg_latency_ms * request_count + ?2) / (request_count + 1),
                    request_count  = request_count + 1,
                    error_count    = error_count + ?3
                 WHERE id = ?1",
                params![id, duration_ms as f64, is_error as i64],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(ConnectorError::NotFound(format!("connector {}", id)));
        }
        Ok(())
    }

    async fn append_query_log(&self, entry: &QueryLogEntry) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO query_log
                    (id, connector_id, organization_id, operation, resource, duration_ms,
                     row_count, success, error_kind, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.id,
                    entry.connector_id,
                    entry.organization_id,
                    entry.operation,
                    entry.resource,
                    entry.duration_ms as i64,
                    entry.row_count.map(|n| n as i64),
                    entry.success,
                    entry.error_kind.map(|k| k.as_str()),
                    entry.error_message,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> Result<()> {
        let details = serde_json::to_string(&entry.details).map_err(storage_err)?;
        self.lock()
            .execute(
                "INSERT INTO audit_log (id, organization_id, connector_id, action, details_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id,
                    entry.organization_id,
                    entry.connector_id,
                    entry.action.as_str(),
                    details,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }
}
