//! One sqlx pool per database connector, postgres or sqlite.

use std::str::FromStr;
use std::time::Duration;

use conduit::config::DatabaseConfig;
use conduit::{ConnectorError, Result};
use serde_json::{Number, Value};
use sqlx::postgres::{
    PgArguments, PgColumn, PgHasArrayType, PgPool, PgPoolOptions, PgRow, PgTypeKind,
};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Postgres, Row as _, Sqlite, TypeInfo, ValueRef};

use super::query::{Dialect, SqlStatement};
use crate::types::Row;

/// Rows returned or affected by one statement.
#[derive(Debug, Default)]
pub struct StatementOutcome {
    pub rows: Vec<Row>,
    pub affected: u64,
}

pub enum DbPool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    pub async fn connect(url: &str, settings: &DatabaseConfig) -> Result<Self> {
        let acquire_timeout = Duration::from_secs(settings.acquire_timeout_secs);
        let idle_timeout = Duration::from_secs(settings.idle_timeout_secs);

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(settings.max_connections.max(1))
                .min_connections(settings.min_connections)
                .acquire_timeout(acquire_timeout)
                .idle_timeout(idle_timeout)
                .connect(url)
                .await
                .map_err(map_connect_error)?;
            Ok(DbPool::Postgres(pool))
        } else if url.starts_with("sqlite:") {
            let options = SqliteConnectOptions::from_str(url)
                .map_err(|e| ConnectorError::Validation(format!("invalid sqlite url: {}", e)))?
                .create_if_missing(true)
                .foreign_keys(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(settings.max_connections.max(1))
                .min_connections(settings.min_connections)
                .acquire_timeout(acquire_timeout)
                .idle_timeout(idle_timeout)
                .connect_with(options)
                .await
                .map_err(map_connect_error)?;
            Ok(DbPool::Sqlite(pool))
        } else {
            Err(ConnectorError::Validation(
                "database url must use the postgres:// or sqlite: scheme".into(),
            ))
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DbPool::Postgres(_) => Dialect::Postgres,
            DbPool::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            DbPool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            DbPool::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        }
        .map_err(map_sqlx_error)
    }

    pub async fn run(&self, stmt: &SqlStatement) -> Result<StatementOutcome> {
        match self {
            DbPool::Postgres(pool) => {
                let query = bind_pg(sqlx::query(&stmt.sql), &stmt.params);
                if stmt.returns_rows {
                    let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
                    pg_outcome(&rows)
                } else {
                    let done = query.execute(pool).await.map_err(map_sqlx_error)?;
                    Ok(StatementOutcome {
                        rows: Vec::new(),
                        affected: done.rows_affected(),
                    })
                }
            }
            DbPool::Sqlite(pool) => {
                let query = bind_sqlite(sqlx::query(&stmt.sql), &stmt.params);
                if stmt.returns_rows {
                    let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
                    Ok(sqlite_outcome(&rows))
                } else {
                    let done = query.execute(pool).await.map_err(map_sqlx_error)?;
                    Ok(StatementOutcome {
                        rows: Vec::new(),
                        affected: done.rows_affected(),
                    })
                }
            }
        }
    }

    /// Runs every statement in one transaction. Any failure rolls back all of them.
    pub async fn run_in_transaction(&self, stmts: &[SqlStatement]) -> Result<Vec<StatementOutcome>> {
        let mut outcomes = Vec::with_capacity(stmts.len());
        match self {
            DbPool::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
                for stmt in stmts {
                    let query = bind_pg(sqlx::query(&stmt.sql), &stmt.params);
                    let outcome = if stmt.returns_rows {
                        pg_outcome(&query.fetch_all(&mut *tx).await.map_err(map_sqlx_error)?)?
                    } else {
                        let done = query.execute(&mut *tx).await.map_err(map_sqlx_error)?;
                        StatementOutcome {
                            rows: Vec::new(),
                            affected: done.rows_affected(),
                        }
                    };
                    outcomes.push(outcome);
                }
                tx.commit().await.map_err(map_sqlx_error)?;
            }
            DbPool::Sqlite(pool) => {
                let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
                for stmt in stmts {
                    let query = bind_sqlite(sqlx::query(&stmt.sql), &stmt.params);
                    let outcome = if stmt.returns_rows {
                        sqlite_outcome(&query.fetch_all(&mut *tx).await.map_err(map_sqlx_error)?)
                    } else {
                        let done = query.execute(&mut *tx).await.map_err(map_sqlx_error)?;
                        StatementOutcome {
                            rows: Vec::new(),
                            affected: done.rows_affected(),
                        }
                    };
                    outcomes.push(outcome);
                }
                tx.commit().await.map_err(map_sqlx_error)?;
            }
        }
        Ok(outcomes)
    }

    pub async fn close(&self) {
        match self {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }
}

fn pg_outcome(rows: &[PgRow]) -> Result<StatementOutcome> {
    Ok(StatementOutcome {
        rows: rows.iter().map(pg_row_to_map).collect::<Result<_>>()?,
        affected: rows.len() as u64,
    })
}

fn sqlite_outcome(rows: &[SqliteRow]) -> StatementOutcome {
    StatementOutcome {
        rows: rows.iter().map(sqlite_row_to_map).collect(),
        affected: rows.len() as u64,
    }
}

fn bind_pg<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(sqlx::types::Json(other.clone())),
        };
    }
    query
}

fn bind_sqlite<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn pg_row_to_map(row: &PgRow) -> Result<Row> {
    let mut map = Row::new();
    for column in row.columns() {
        map.insert(column.name().to_string(), pg_column_value(row, column)?);
    }
    Ok(map)
}

fn pg_get<'r, T>(row: &'r PgRow, column: &PgColumn) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column.ordinal())
        .map_err(|e| ConnectorError::query_failed(format!("cannot decode column {}: {}", column.name(), e)))
}

fn pg_array<T>(row: &PgRow, column: &PgColumn) -> Result<Value>
where
    T: for<'a> sqlx::Decode<'a, Postgres> + sqlx::Type<Postgres> + PgHasArrayType + Into<Value>,
{
    let items: Vec<Option<T>> = pg_get(row, column)?;
    Ok(Value::Array(
        items
            .into_iter()
            .map(|item| item.map(Into::into).unwrap_or(Value::Null))
            .collect(),
    ))
}

/// Decodes one column to JSON. A type with no decoding is a query failure,
/// never a silent `null`.
fn pg_column_value(row: &PgRow, column: &PgColumn) -> Result<Value> {
    let idx = column.ordinal();
    if row.try_get_raw(idx).map_err(map_sqlx_error)?.is_null() {
        return Ok(Value::Null);
    }

    let type_info = column.type_info();
    let value = match type_info.name() {
        "BOOL" => Value::Bool(pg_get(row, column)?),
        "INT2" => Value::from(pg_get::<i16>(row, column)?),
        "INT4" => Value::from(pg_get::<i32>(row, column)?),
        "INT8" => Value::from(pg_get::<i64>(row, column)?),
        "FLOAT4" => float_value(pg_get::<f32>(row, column)? as f64),
        "FLOAT8" => float_value(pg_get::<f64>(row, column)?),
        // Exact decimal text; JSON numbers would round
        "NUMERIC" => Value::String(pg_get::<rust_decimal::Decimal>(row, column)?.to_string()),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => Value::String(pg_get(row, column)?),
        "UUID" => Value::String(pg_get::<uuid::Uuid>(row, column)?.to_string()),
        "TIMESTAMPTZ" => Value::String(pg_get::<chrono::DateTime<chrono::Utc>>(row, column)?.to_rfc3339()),
        "TIMESTAMP" => Value::String(pg_get::<chrono::NaiveDateTime>(row, column)?.to_string()),
        "DATE" => Value::String(pg_get::<chrono::NaiveDate>(row, column)?.to_string()),
        "TIME" => Value::String(pg_get::<chrono::NaiveTime>(row, column)?.to_string()),
        "JSON" | "JSONB" => pg_get::<Value>(row, column)?,
        "BYTEA" => {
            let bytes: Vec<u8> = pg_get(row, column)?;
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            Value::String(format!("\\x{}", hex))
        }
        "BOOL[]" => pg_array::<bool>(row, column)?,
        "INT2[]" => pg_array::<i16>(row, column)?,
        "INT4[]" => pg_array::<i32>(row, column)?,
        "INT8[]" => pg_array::<i64>(row, column)?,
        "FLOAT8[]" => pg_array::<f64>(row, column)?,
        "TEXT[]" | "VARCHAR[]" => pg_array::<String>(row, column)?,
        _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => Value::String(
            row.try_get_unchecked::<String, _>(idx)
                .map_err(|e| ConnectorError::query_failed(format!("cannot decode column {}: {}", column.name(), e)))?,
        ),
        other => {
            return Err(ConnectorError::query_failed(format!(
                "column {} has type {} which cannot be returned as JSON; cast it to text in the query",
                column.name(),
                other
            )))
        }
    };
    Ok(value)
}

fn sqlite_row_to_map(row: &SqliteRow) -> Row {
    let mut map = Row::new();
    for column in row.columns() {
        map.insert(column.name().to_string(), sqlite_column_value(row, column));
    }
    map
}

/// Decodes by the stored value's runtime type; sqlite columns are dynamically typed.
fn sqlite_column_value(row: &SqliteRow, column: &sqlx::sqlite::SqliteColumn) -> Value {
    let idx = column.ordinal();
    let declared = column.type_info().name().to_ascii_uppercase();
    let runtime = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
        Err(_) => return Value::Null,
    };

    match runtime.as_str() {
        "INTEGER" | "INT8" | "BOOLEAN" => match row.try_get_unchecked::<i64, _>(idx) {
            Ok(v) if declared == "BOOLEAN" => Value::Bool(v != 0),
            Ok(v) => Value::Number(v.into()),
            Err(_) => Value::Null,
        },
        "REAL" => row
            .try_get_unchecked::<f64, _>(idx)
            .map(float_value)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get_unchecked::<String, _>(idx)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Maps driver errors onto the taxonomy. Messages never include the URL.
pub fn map_sqlx_error(e: sqlx::Error) -> ConnectorError {
    match e {
        sqlx::Error::PoolTimedOut => {
            ConnectorError::ConnectionFailed("timed out acquiring a pooled connection".into())
        }
        sqlx::Error::Io(e) => ConnectorError::ConnectionFailed(format!("I/O error: {}", e)),
        sqlx::Error::Tls(e) => ConnectorError::ConnectionFailed(format!("TLS error: {}", e)),
        sqlx::Error::PoolClosed => ConnectorError::ConnectionFailed("connection pool is closed".into()),
        sqlx::Error::RowNotFound => ConnectorError::query_failed("no rows returned"),
        sqlx::Error::Database(db) => ConnectorError::query_failed(db.message().to_string()),
        other => ConnectorError::query_failed(other.to_string()),
    }
}

fn map_connect_error(e: sqlx::Error) -> ConnectorError {
    if let sqlx::Error::Database(db) = &e {
        // 28000 invalid_authorization_specification, 28P01 invalid_password
        let code = db.code().map(|c| c.to_string()).unwrap_or_default();
        if code.starts_with("28") {
            return ConnectorError::InvalidCredentials(
                "database rejected the supplied credentials".into(),
            );
        }
        return ConnectorError::ConnectionFailed(db.message().to_string());
    }
    if matches!(e, sqlx::Error::Configuration(_)) {
        return ConnectorError::Validation("invalid database connection settings".into());
    }
    match map_sqlx_error(e) {
        ConnectorError::QueryFailed { message, .. } => ConnectorError::ConnectionFailed(message),
        other => other,
    }
}
