//! Relational database adapter (postgres, sqlite).
//!
//! Structured queries and actions are translated into parameterized SQL by
//! [`query`] and executed on one pooled sqlx client per instance.

pub mod pool;
pub mod query;
pub mod schema;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use conduit::rate_limit::RateLimitConfig;
use conduit::{ConnectorError, Result};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{check_binding, first_str, not_initialized, open_credentials, with_timeout, AdapterContext};
use crate::connector::Connector;
use crate::retry::with_retry;
use crate::schema::Schema;
use crate::tracker::InstanceMetrics;
use crate::types::{
    Action, ActionKind, ActionResult, ConnectorConfig, ConnectorType, HealthStatus, InstanceStats,
    PerformanceMetrics, QueryOperation, QueryParams, QueryResult, ResultMetadata, TestResult,
};
use crate::validation::{effective_limit, validate_action, validate_query};
use pool::{DbPool, StatementOutcome};
use query::{ColumnTypes, Dialect, SqlStatement};

/// Live state, present between `initialize` and `dispose`.
struct Session {
    pool: DbPool,
    rate_limit: Option<RateLimitConfig>,
    /// Postgres schema searched by introspection.
    pg_schema: String,
    /// Declared column types per resource, used to cast postgres binds.
    column_types: DashMap<String, Arc<ColumnTypes>>,
}

pub struct DatabaseConnector {
    id: String,
    ctx: AdapterContext,
    session: RwLock<Option<Session>>,
    metrics: InstanceMetrics,
}

impl DatabaseConnector {
    pub fn new(id: &str, ctx: AdapterContext) -> Self {
        Self {
            id: id.to_string(),
            ctx,
            session: RwLock::new(None),
            metrics: InstanceMetrics::new(),
        }
    }

    /// Admission and shape checks shared by every data call.
    fn admit(&self, session: &Session) -> Result<()> {
        self.ctx.limiter.acquire(&self.id, session.rate_limit.as_ref())
    }

    async fn run(&self, session: &Session, stmt: &SqlStatement, label: &str) -> Result<StatementOutcome> {
        let timeout = self.ctx.call_timeout();
        debug!(connector_id = %self.id, sql = %stmt.sql, params = stmt.params.len(), "Running statement");
        with_retry(&self.ctx.settings.retry, label, || {
            with_timeout(timeout, session.pool.run(stmt))
        })
        .await
    }

    /// Column types of `resource`, looked up once per session. Sqlite needs none.
    async fn column_types(&self, session: &Session, resource: &str) -> Result<Option<Arc<ColumnTypes>>> {
        if session.pool.dialect() != Dialect::Postgres {
            return Ok(None);
        }
        let cached = session.column_types.get(resource).map(|t| Arc::clone(&t));
        if let Some(types) = cached {
            return Ok(Some(types));
        }
        let types = Arc::new(
            with_timeout(
                self.ctx.call_timeout(),
                schema::pg_column_types(&session.pool, &session.pg_schema, resource),
            )
            .await?,
        );
        session
            .column_types
            .insert(resource.to_string(), Arc::clone(&types));
        Ok(Some(types))
    }

    async fn statement_for(&self, session: &Session, action: &Action) -> Result<SqlStatement> {
        let dialect = session.pool.dialect();
        if action.kind == ActionKind::Execute {
            return query::build_raw(action.payload.as_ref());
        }
        let types = self.column_types(session, &action.resource).await?;
        let types = types.as_deref();
        let empty = Map::new();
        let predicate = action.match_predicate.as_ref().unwrap_or(&empty);
        match action.kind {
            ActionKind::Create => {
                let payload = action
                    .payload
                    .as_ref()
                    .ok_or_else(|| ConnectorError::Validation("create requires a payload".into()))?;
                query::build_insert(dialect, types, &action.resource, payload)
            }
            ActionKind::Update => {
                let payload = action
                    .payload
                    .as_ref()
                    .ok_or_else(|| ConnectorError::Validation("update requires a payload".into()))?;
                query::build_update(dialect, types, &action.resource, payload, predicate)
            }
            ActionKind::Delete => query::build_delete(dialect, types, &action.resource, predicate),
            ActionKind::Execute => query::build_raw(action.payload.as_ref()),
        }
    }
}

/// Connection URL from pre-built URL credentials or structured fields.
pub fn connection_url(provider: &str, options: &Map<String, Value>, creds: &Map<String, Value>) -> Result<String> {
    if let Some(url) = first_str(creds, &["databaseUrl", "url", "connectionString"]) {
        return Ok(url.to_string());
    }

    if provider.eq_ignore_ascii_case("sqlite") {
        let path = first_str(creds, &["filename", "path"])
            .or_else(|| first_str(options, &["filename", "path"]))
            .ok_or_else(|| {
                ConnectorError::InvalidCredentials("sqlite connector requires a filename".into())
            })?;
        return Ok(format!("sqlite://{}", path));
    }

    let host = first_str(creds, &["host"])
        .or_else(|| first_str(options, &["host"]))
        .ok_or_else(|| ConnectorError::InvalidCredentials("database host is required".into()))?;
    let database = first_str(creds, &["database"])
        .or_else(|| first_str(options, &["database"]))
        .ok_or_else(|| ConnectorError::InvalidCredentials("database name is required".into()))?;
    let user = first_str(creds, &["user", "username"])
        .ok_or_else(|| ConnectorError::InvalidCredentials("database user is required".into()))?;
    let port = creds
        .get("port")
        .or_else(|| options.get("port"))
        .and_then(|p| p.as_u64().or_else(|| p.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(5432);

    let auth = match first_str(creds, &["password"]) {
        Some(password) => format!(
            "{}:{}",
            urlencoding::encode(user),
            urlencoding::encode(password)
        ),
        None => urlencoding::encode(user).into_owned(),
    };
    let mut url = format!("postgres://{}@{}:{}/{}", auth, host, port, urlencoding::encode(database));
    if let Some(ssl) = first_str(options, &["sslMode", "sslmode"]) {
        url.push_str(&format!("?sslmode={}", urlencoding::encode(ssl)));
    }
    Ok(url)
}

fn rows_total(outcome: &StatementOutcome) -> Option<u64> {
    outcome
        .rows
        .first()
        .and_then(|r| r.get("total"))
        .and_then(Value::as_u64)
}

fn action_result(outcome: StatementOutcome, started: Instant) -> ActionResult {
    let row_count = outcome.rows.len();
    ActionResult {
        success: true,
        affected_rows: outcome.affected,
        rows: outcome.rows,
        performance: PerformanceMetrics {
            duration_ms: started.elapsed().as_millis() as u64,
            row_count,
        },
    }
}

#[async_trait]
impl Connector for DatabaseConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Database
    }

    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self, config: &ConnectorConfig) -> Result<()> {
        check_binding(&self.id, ConnectorType::Database, config)?;

        let mut session = self.session.write().await;
        if let Some(old) = session.take() {
            old.pool.close().await;
        }

        let creds = open_credentials(&self.ctx.vault, config)?;
        let url = connection_url(&config.provider, &config.options, &creds)?;
        drop(creds);

        let timeout = self.ctx.call_timeout();
        let pool = with_timeout(timeout, DbPool::connect(&url, &self.ctx.settings.database)).await?;
        if let Err(e) = with_timeout(timeout, pool.ping()).await {
            pool.close().await;
            return Err(e);
        }

        info!(
            connector_id = %self.id,
            provider = %config.provider,
            dialect = ?pool.dialect(),
            "Database connector initialized"
        );
        *session = Some(Session {
            pool,
            rate_limit: config.rate_limit.clone(),
            pg_schema: config.option_str("schema").unwrap_or("public").to_string(),
            column_types: DashMap::new(),
        });
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let mut session = self.session.write().await;
        if let Some(old) = session.take() {
            old.pool.close().await;
            info!(connector_id = %self.id, "Database connector disposed");
        }
        Ok(())
    }

    async fn is_initialized(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn test(&self) -> Result<TestResult> {
        let started = Instant::now();
        let outcome = self
            .metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                self.admit(session)?;
                with_timeout(self.ctx.call_timeout(), session.pool.ping()).await
            })
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => Ok(TestResult {
                success: true,
                message: "Connection successful".to_string(),
                latency_ms,
            }),
            Err(e @ (ConnectorError::NotInitialized(_) | ConnectorError::RateLimitExceeded { .. })) => Err(e),
            Err(e) => {
                warn!(connector_id = %self.id, error = %e, "Database connection test failed");
                Ok(TestResult {
                    success: false,
                    message: e.to_string(),
                    latency_ms,
                })
            }
        }
    }

    async fn query(&self, params: &QueryParams) -> Result<QueryResult> {
        self.metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                let limits = &self.ctx.settings.query;
                validate_query(params, limits)?;
                self.admit(session)?;

                let started = Instant::now();
                let dialect = session.pool.dialect();
                let limit = effective_limit(params, limits);
                let types = self.column_types(session, &params.resource).await?;
                let types = types.as_deref();

                let (rows, total) = match params.operation {
                    QueryOperation::Aggregate => {
                        let stmt = query::build_aggregate(dialect, types, params, limit)?;
                        let outcome = self.run(session, &stmt, "db.aggregate").await?;
                        (outcome.rows, None)
                    }
                    QueryOperation::Read | QueryOperation::Search => {
                        let count = query::build_count(dialect, types, params)?;
                        let total = rows_total(&self.run(session, &count, "db.count").await?);
                        let select = query::build_select(dialect, types, params, limit)?;
                        let outcome = self.run(session, &select, "db.select").await?;
                        (outcome.rows, total)
                    }
                };

                let offset = params.offset.unwrap_or(0) as u64;
                let has_more = total
                    .map(|t| offset + (rows.len() as u64) < t)
                    .unwrap_or(false);
                let row_count = rows.len();
                debug!(
                    connector_id = %self.id,
                    resource = %params.resource,
                    rows = row_count,
                    "Database query complete"
                );
                Ok(QueryResult {
                    rows,
                    metadata: ResultMetadata { total, has_more },
                    performance: PerformanceMetrics {
                        duration_ms: started.elapsed().as_millis() as u64,
                        row_count,
                    },
                })
            })
            .await
    }

    async fn execute(&self, action: &Action) -> Result<ActionResult> {
        self.metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                validate_action(action)?;
                self.admit(session)?;

                let started = Instant::now();
                let stmt = self.statement_for(session, action).await?;
                let label = format!("db.{}", action.kind.as_str());
                let outcome = self.run(session, &stmt, &label).await?;
                if action.kind == ActionKind::Execute {
                    // Raw SQL may have altered tables
                    session.column_types.clear();
                }
                Ok(action_result(outcome, started))
            })
            .await
    }

    async fn execute_transaction(&self, actions: &[Action]) -> Result<Vec<ActionResult>> {
        self.metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                if actions.is_empty() {
                    return Err(ConnectorError::Validation("transaction has no actions".into()));
                }
                for action in actions {
                    validate_action(action)?;
                }
                self.admit(session)?;

                let mut stmts = Vec::with_capacity(actions.len());
                for action in actions {
                    stmts.push(self.statement_for(session, action).await?);
                }

                let started = Instant::now();
                // Not retried: a partially-applied batch has already been rolled back
                let outcomes = with_timeout(
                    self.ctx.call_timeout(),
                    session.pool.run_in_transaction(&stmts),
                )
                .await?;
                if actions.iter().any(|a| a.kind == ActionKind::Execute) {
                    session.column_types.clear();
                }
                info!(
                    connector_id = %self.id,
                    statements = stmts.len(),
                    "Transaction committed"
                );
                Ok(outcomes
                    .into_iter()
                    .map(|o| action_result(o, started))
                    .collect())
            })
            .await
    }

    async fn get_schema(&self) -> Result<Schema> {
        self.metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                self.admit(session)?;
                session.column_types.clear();
                with_timeout(
                    self.ctx.call_timeout(),
                    schema::introspect(&session.pool, &session.pg_schema),
                )
                .await
            })
            .await
    }

    async fn health_status(&self) -> HealthStatus {
        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return HealthStatus {
                healthy: false,
                initialized: false,
                latency_ms: None,
                message: Some("not initialized".to_string()),
                checked_at: Utc::now(),
            };
        };

        let started = Instant::now();
        let outcome = with_timeout(self.ctx.call_timeout(), session.pool.ping()).await;
        HealthStatus {
            healthy: outcome.is_ok(),
            initialized: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            message: outcome.err().map(|e| e.to_string()),
            checked_at: Utc::now(),
        }
    }

    fn stats(&self) -> InstanceStats {
        self.metrics.snapshot()
    }
}
