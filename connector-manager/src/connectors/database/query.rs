//! Structured query → parameterized SQL.
//!
//! Identifiers are always double-quoted; values are always bound. Nothing
//! from the caller is spliced into SQL text except quoted identifiers and the
//! numeric limit/offset.
//!
//! Postgres parameters are typed by the driver (strings as TEXT, NULLs as
//! TEXT). When the target table's column types are known, a value bound for a
//! column carries an explicit `$n::type` cast so it is read as that column's
//! type.

use std::collections::HashMap;

use conduit::{ConnectorError, Result};
use serde_json::{Map, Value};

use crate::types::{QueryParams, SortDirection};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// SQL text plus its positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Whether the statement produces a result set.
    pub returns_rows: bool,
}

/// Column name → quoted SQL type name, e.g. `"pg_catalog"."int4"`.
pub type ColumnTypes = HashMap<String, String>;

struct Builder<'a> {
    dialect: Dialect,
    types: Option<&'a ColumnTypes>,
    sql: String,
    params: Vec<Value>,
}

impl<'a> Builder<'a> {
    fn new(dialect: Dialect, types: Option<&'a ColumnTypes>) -> Self {
        Self {
            dialect,
            types,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn bind(&mut self, value: Value) {
        self.params.push(value);
        match self.dialect {
            Dialect::Postgres => {
                self.sql.push('$');
                self.sql.push_str(&self.params.len().to_string());
            }
            Dialect::Sqlite => self.sql.push('?'),
        }
    }

    /// Binds a value compared with or stored into `column`.
    fn bind_for(&mut self, column: &str, value: Value) {
        self.bind(value);
        if self.dialect != Dialect::Postgres {
            return;
        }
        if let Some(ty) = self.types.and_then(|t| t.get(column)) {
            self.sql.push_str("::");
            self.sql.push_str(ty);
        }
    }

    fn finish(self, returns_rows: bool) -> SqlStatement {
        SqlStatement {
            sql: self.sql,
            params: self.params,
            returns_rows,
        }
    }
}

/// Quotes an identifier, treating `.` as a schema separator.
pub fn quote_ident(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(ConnectorError::Validation("empty identifier".into()));
    }
    let parts: Vec<String> = name
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect();
    Ok(parts.join("."))
}

pub fn build_select(
    dialect: Dialect,
    types: Option<&ColumnTypes>,
    params: &QueryParams,
    limit: u32,
) -> Result<SqlStatement> {
    let mut b = Builder::new(dialect, types);
    b.push("SELECT ");
    match &params.fields {
        Some(fields) if !fields.is_empty() => {
            let cols = fields
                .iter()
                .map(|f| quote_ident(f))
                .collect::<Result<Vec<_>>>()?;
            b.push(&cols.join(", "));
        }
        _ => b.push("*"),
    }
    b.push(" FROM ");
    b.push(&quote_ident(&params.resource)?);
    push_where(&mut b, params)?;
    push_order(&mut b, params)?;
    b.push(&format!(" LIMIT {}", limit));
    if let Some(offset) = params.offset.filter(|o| *o > 0) {
        b.push(&format!(" OFFSET {}", offset));
    }
    Ok(b.finish(true))
}

/// `SELECT COUNT(*) AS "total"` over the same predicate as [`build_select`].
pub fn build_count(dialect: Dialect, types: Option<&ColumnTypes>, params: &QueryParams) -> Result<SqlStatement> {
    let mut b = Builder::new(dialect, types);
    b.push("SELECT COUNT(*) AS \"total\" FROM ");
    b.push(&quote_ident(&params.resource)?);
    push_where(&mut b, params)?;
    Ok(b.finish(true))
}

pub fn build_aggregate(
    dialect: Dialect,
    types: Option<&ColumnTypes>,
    params: &QueryParams,
    limit: u32,
) -> Result<SqlStatement> {
    let spec = params
        .aggregate
        .as_ref()
        .ok_or_else(|| ConnectorError::Validation("aggregate spec is required".into()))?;

    let groups = spec
        .group_by
        .iter()
        .map(|g| quote_ident(g))
        .collect::<Result<Vec<_>>>()?;

    let target = match &spec.field {
        Some(field) => quote_ident(field)?,
        None => "*".to_string(),
    };
    let mut expr = format!("{}({})", spec.function.sql_name(), target);
    // SUM/AVG over integers produce NUMERIC in postgres
    if dialect == Dialect::Postgres
        && matches!(
            spec.function,
            crate::types::AggregateFunction::Sum | crate::types::AggregateFunction::Avg
        )
    {
        expr = format!("CAST({} AS DOUBLE PRECISION)", expr);
    }
    let alias = quote_ident(&spec.function.sql_name().to_ascii_lowercase())?;

    let mut b = Builder::new(dialect, types);
    b.push("SELECT ");
    for g in &groups {
        b.push(g);
        b.push(", ");
    }
    b.push(&format!("{} AS {} FROM ", expr, alias));
    b.push(&quote_ident(&params.resource)?);
    push_where(&mut b, params)?;
    if !groups.is_empty() {
        b.push(" GROUP BY ");
        b.push(&groups.join(", "));
    }
    push_order(&mut b, params)?;
    b.push(&format!(" LIMIT {}", limit));
    Ok(b.finish(true))
}

/// INSERT for one object or a bulk array of objects. Missing keys become NULL.
pub fn build_insert(
    dialect: Dialect,
    types: Option<&ColumnTypes>,
    resource: &str,
    payload: &Value,
) -> Result<SqlStatement> {
    let records: Vec<&Map<String, Value>> = match payload {
        Value::Object(obj) => vec![obj],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .ok_or_else(|| ConnectorError::Validation("bulk create expects objects".into()))
            })
            .collect::<Result<_>>()?,
        _ => {
            return Err(ConnectorError::Validation(
                "create payload must be an object or an array of objects".into(),
            ))
        }
    };
    if records.is_empty() {
        return Err(ConnectorError::Validation("create payload is empty".into()));
    }

    let mut columns: Vec<&String> = Vec::new();
    for record in &records {
        for key in record.keys() {
            if !columns.contains(&key) {
                columns.push(key);
            }
        }
    }
    if columns.is_empty() {
        return Err(ConnectorError::Validation("create payload has no fields".into()));
    }

    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;

    let mut b = Builder::new(dialect, types);
    b.push("INSERT INTO ");
    b.push(&quote_ident(resource)?);
    b.push(&format!(" ({}) VALUES ", quoted.join(", ")));
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.push("(");
        for (j, column) in columns.iter().enumerate() {
            if j > 0 {
                b.push(", ");
            }
            b.bind_for(column, record.get(*column).cloned().unwrap_or(Value::Null));
        }
        b.push(")");
    }
    b.push(" RETURNING *");
    Ok(b.finish(true))
}

pub fn build_update(
    dialect: Dialect,
    types: Option<&ColumnTypes>,
    resource: &str,
    payload: &Value,
    predicate: &Map<String, Value>,
) -> Result<SqlStatement> {
    let changes = payload
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| ConnectorError::Validation("update payload must be a non-empty object".into()))?;
    require_predicate(predicate)?;

    let mut b = Builder::new(dialect, types);
    b.push("UPDATE ");
    b.push(&quote_ident(resource)?);
    b.push(" SET ");
    for (i, (column, value)) in changes.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.push(&quote_ident(column)?);
        b.push(" = ");
        b.bind_for(column, value.clone());
    }
    b.push(" WHERE ");
    push_conditions(&mut b, predicate)?;
    b.push(" RETURNING *");
    Ok(b.finish(true))
}

pub fn build_delete(
    dialect: Dialect,
    types: Option<&ColumnTypes>,
    resource: &str,
    predicate: &Map<String, Value>,
) -> Result<SqlStatement> {
    require_predicate(predicate)?;

    let mut b = Builder::new(dialect, types);
    b.push("DELETE FROM ");
    b.push(&quote_ident(resource)?);
    b.push(" WHERE ");
    push_conditions(&mut b, predicate)?;
    Ok(b.finish(false))
}

/// Raw statement from an `execute` action payload: `{"statement": .., "params": [..]}`.
pub fn build_raw(payload: Option<&Value>) -> Result<SqlStatement> {
    let payload = payload
        .and_then(Value::as_object)
        .ok_or_else(|| ConnectorError::Validation("execute payload must be an object".into()))?;
    let sql = payload
        .get("statement")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConnectorError::Validation("execute payload requires a statement".into()))?;
    let params = match payload.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(ConnectorError::Validation("execute params must be an array".into())),
    };
    Ok(SqlStatement {
        sql: sql.to_string(),
        params,
        returns_rows: produces_rows(sql),
    })
}

fn produces_rows(sql: &str) -> bool {
    let lowered = sql.trim_start().to_ascii_lowercase();
    ["select", "with", "pragma", "values", "explain", "show"]
        .iter()
        .any(|kw| lowered.starts_with(kw))
        || lowered.contains(" returning ")
}

fn require_predicate(predicate: &Map<String, Value>) -> Result<()> {
    if predicate.is_empty() {
        return Err(ConnectorError::Validation("match predicate is empty".into()));
    }
    Ok(())
}

fn push_where(b: &mut Builder, params: &QueryParams) -> Result<()> {
    let filters = params.filters.as_ref().filter(|f| !f.is_empty());
    let search = params.search.as_ref();
    if filters.is_none() && search.is_none() {
        return Ok(());
    }

    b.push(" WHERE ");
    let mut wrote = false;
    if let Some(filters) = filters {
        push_conditions(b, filters)?;
        wrote = true;
    }
    if let Some(search) = search {
        if search.fields.is_empty() {
            return Err(ConnectorError::Validation(
                "search on a database connector requires fields".into(),
            ));
        }
        if wrote {
            b.push(" AND ");
        }
        let pattern = Value::String(format!("%{}%", search.term));
        b.push("(");
        for (i, field) in search.fields.iter().enumerate() {
            if i > 0 {
                b.push(" OR ");
            }
            match b.dialect {
                Dialect::Postgres => {
                    b.push(&format!("CAST({} AS TEXT) ILIKE ", quote_ident(field)?));
                }
                Dialect::Sqlite => {
                    b.push(&format!("{} LIKE ", quote_ident(field)?));
                }
            }
            b.bind(pattern.clone());
        }
        b.push(")");
    }
    Ok(())
}

/// ANDs one condition per filter entry.
fn push_conditions(b: &mut Builder, filters: &Map<String, Value>) -> Result<()> {
    for (i, (field, value)) in filters.iter().enumerate() {
        if i > 0 {
            b.push(" AND ");
        }
        match value {
            Value::Object(ops) => push_operators(b, field, ops)?,
            other => push_comparison(b, field, "$eq", other)?,
        }
    }
    Ok(())
}

fn push_operators(b: &mut Builder, field: &str, ops: &Map<String, Value>) -> Result<()> {
    if ops.is_empty() {
        return Err(ConnectorError::Validation(format!(
            "empty operator object for {}",
            field
        )));
    }
    for (i, (op, operand)) in ops.iter().enumerate() {
        if i > 0 {
            b.push(" AND ");
        }
        push_comparison(b, field, op, operand)?;
    }
    Ok(())
}

fn push_comparison(b: &mut Builder, field: &str, op: &str, operand: &Value) -> Result<()> {
    let column = quote_ident(field)?;
    match (op, operand) {
        ("$eq", Value::Null) => b.push(&format!("{} IS NULL", column)),
        ("$ne", Value::Null) => b.push(&format!("{} IS NOT NULL", column)),
        ("$eq", Value::Array(items)) | ("$in", Value::Array(items)) => push_in(b, field, &column, items),
        ("$in", _) => {
            return Err(ConnectorError::Validation(format!(
                "$in on {} expects an array",
                column
            )))
        }
        (_, Value::Object(_)) | (_, Value::Array(_)) => {
            return Err(ConnectorError::Validation(format!(
                "operator {} on {} expects a scalar",
                op, column
            )))
        }
        _ => {
            let sql_op = match op {
                "$eq" => "=",
                "$ne" => "<>",
                "$gt" => ">",
                "$gte" => ">=",
                "$lt" => "<",
                "$lte" => "<=",
                "$like" => "LIKE",
                other => {
                    return Err(ConnectorError::Validation(format!(
                        "unsupported filter operator {}",
                        other
                    )))
                }
            };
            b.push(&format!("{} {} ", column, sql_op));
            // LIKE patterns stay text whatever the column type
            if op == "$like" {
                b.bind(operand.clone());
            } else {
                b.bind_for(field, operand.clone());
            }
        }
    }
    Ok(())
}

fn push_in(b: &mut Builder, field: &str, column: &str, items: &[Value]) {
    if items.is_empty() {
        b.push("1 = 0");
        return;
    }
    b.push(&format!("{} IN (", column));
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.bind_for(field, item.clone());
    }
    b.push(")");
}

fn push_order(b: &mut Builder, params: &QueryParams) -> Result<()> {
    if params.sort.is_empty() {
        return Ok(());
    }
    let parts = params
        .sort
        .iter()
        .map(|s| {
            let dir = match s.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            Ok(format!("{} {}", quote_ident(&s.field)?, dir))
        })
        .collect::<Result<Vec<_>>>()?;
    b.push(" ORDER BY ");
    b.push(&parts.join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateFunction, AggregateSpec};
    use serde_json::json;

    fn predicate(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_select_with_filters_sort_and_paging() {
        let params = QueryParams::read("orders")
            .with_filter("status", json!("open"))
            .with_filter("total", json!({"$gte": 10}))
            .with_sort("created_at", SortDirection::Desc)
            .with_limit(5)
            .with_offset(10);

        let stmt = build_select(Dialect::Postgres, None, &params, 5).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"orders\" WHERE \"status\" = $1 AND \"total\" >= $2 \
             ORDER BY \"created_at\" DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(stmt.params, vec![json!("open"), json!(10)]);
    }

    #[test]
    fn test_sqlite_uses_question_marks() {
        let params = QueryParams::read("orders")
            .with_filter("id", json!([1, 2, 3]))
            .with_fields(&["id", "status"]);

        let stmt = build_select(Dialect::Sqlite, None, &params, 100).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"status\" FROM \"orders\" WHERE \"id\" IN (?, ?, ?) LIMIT 100"
        );
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn test_null_and_empty_array_filters() {
        let params = QueryParams::read("t")
            .with_filter("deleted_at", Value::Null)
            .with_filter("owner", json!({"$ne": null}))
            .with_filter("tag", json!([]));

        let stmt = build_count(Dialect::Sqlite, None, &params).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS \"total\" FROM \"t\" WHERE \"deleted_at\" IS NULL \
             AND \"owner\" IS NOT NULL AND 1 = 0"
        );
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_identifiers_are_escaped() {
        assert_eq!(quote_ident("public.users").unwrap(), "\"public\".\"users\"");
        assert_eq!(
            quote_ident("x\"; DROP TABLE users; --").unwrap(),
            "\"x\"\"; DROP TABLE users; --\""
        );
        assert!(quote_ident(" ").is_err());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let params = QueryParams::read("t").with_filter("a", json!({"$regex": "x"}));
        assert!(build_select(Dialect::Sqlite, None, &params, 10).is_err());
    }

    #[test]
    fn test_search_requires_fields_and_binds_pattern() {
        let params = QueryParams::search("customers", "ann", &["name", "email"]);
        let stmt = build_select(Dialect::Sqlite, None, &params, 10).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"customers\" WHERE (\"name\" LIKE ? OR \"email\" LIKE ?) LIMIT 10"
        );
        assert_eq!(stmt.params, vec![json!("%ann%"), json!("%ann%")]);

        let pg = build_select(Dialect::Postgres, None, &params, 10).unwrap();
        assert!(pg.sql.contains("CAST(\"name\" AS TEXT) ILIKE $1"));

        let no_fields = QueryParams::search("customers", "ann", &[]);
        assert!(build_select(Dialect::Sqlite, None, &no_fields, 10).is_err());
    }

    #[test]
    fn test_aggregate_with_group_by() {
        let params = QueryParams::aggregate(
            "orders",
            AggregateSpec {
                function: AggregateFunction::Sum,
                field: Some("total".into()),
                group_by: vec!["status".into()],
            },
        );
        let stmt = build_aggregate(Dialect::Sqlite, None, &params, 50).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"status\", SUM(\"total\") AS \"sum\" FROM \"orders\" GROUP BY \"status\" LIMIT 50"
        );

        let pg = build_aggregate(Dialect::Postgres, None, &params, 50).unwrap();
        assert!(pg.sql.contains("CAST(SUM(\"total\") AS DOUBLE PRECISION) AS \"sum\""));
    }

    #[test]
    fn test_bulk_insert_fills_missing_columns() {
        let payload = json!([{"name": "a", "qty": 1}, {"name": "b"}]);
        let stmt = build_insert(Dialect::Postgres, None, "items", &payload).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"items\" (\"name\", \"qty\") VALUES ($1, $2), ($3, $4) RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("a"), json!(1), json!("b"), Value::Null]);
    }

    #[test]
    fn test_update_and_delete_require_predicate() {
        let stmt = build_update(
            Dialect::Sqlite,
            None,
            "items",
            &json!({"qty": 2}),
            &predicate(json!({"id": 7})),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"items\" SET \"qty\" = ? WHERE \"id\" = ? RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!(2), json!(7)]);

        assert!(build_update(Dialect::Sqlite, None, "items", &json!({"qty": 2}), &Map::new()).is_err());
        assert!(build_delete(Dialect::Sqlite, None, "items", &Map::new()).is_err());

        let delete = build_delete(Dialect::Postgres, None, "items", &predicate(json!({"id": {"$in": [1, 2]}}))).unwrap();
        assert_eq!(delete.sql, "DELETE FROM \"items\" WHERE \"id\" IN ($1, $2)");
        assert!(!delete.returns_rows);
    }

    #[test]
    fn test_raw_statement() {
        let stmt = build_raw(Some(&json!({"statement": "SELECT 1 WHERE ? = 1", "params": [1]}))).unwrap();
        assert!(stmt.returns_rows);
        assert_eq!(stmt.params, vec![json!(1)]);

        let stmt = build_raw(Some(&json!({"statement": "UPDATE t SET a = 1"}))).unwrap();
        assert!(!stmt.returns_rows);

        assert!(build_raw(Some(&json!({"params": []}))).is_err());
        assert!(build_raw(None).is_err());
    }

    fn pg_types() -> ColumnTypes {
        [
            ("qty", "\"pg_catalog\".\"int4\""),
            ("due", "\"pg_catalog\".\"timestamptz\""),
        ]
        .into_iter()
        .map(|(c, t)| (c.to_string(), t.to_string()))
        .collect()
    }

    #[test]
    fn test_postgres_binds_cast_to_column_types() {
        let types = pg_types();
        let payload = json!([{"due": "2026-01-01T00:00:00Z", "name": "a", "qty": 1}, {"name": "b"}]);
        let stmt = build_insert(Dialect::Postgres, Some(&types), "items", &payload).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"items\" (\"due\", \"name\", \"qty\") VALUES \
             ($1::\"pg_catalog\".\"timestamptz\", $2, $3::\"pg_catalog\".\"int4\"), \
             ($4::\"pg_catalog\".\"timestamptz\", $5, $6::\"pg_catalog\".\"int4\") RETURNING *"
        );
        assert_eq!(stmt.params[3], Value::Null);

        let params = QueryParams::read("items")
            .with_filter("due", json!({"$gte": "2026-01-01"}))
            .with_filter("name", json!({"$like": "a%"}))
            .with_filter("qty", json!([1, 2]));
        let stmt = build_select(Dialect::Postgres, Some(&types), &params, 10).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"items\" WHERE \"due\" >= $1::\"pg_catalog\".\"timestamptz\" \
             AND \"name\" LIKE $2 \
             AND \"qty\" IN ($3::\"pg_catalog\".\"int4\", $4::\"pg_catalog\".\"int4\") LIMIT 10"
        );

        let update = build_update(
            Dialect::Postgres,
            Some(&types),
            "items",
            &json!({"qty": null}),
            &predicate(json!({"qty": 3})),
        )
        .unwrap();
        assert_eq!(
            update.sql,
            "UPDATE \"items\" SET \"qty\" = $1::\"pg_catalog\".\"int4\" \
             WHERE \"qty\" = $2::\"pg_catalog\".\"int4\" RETURNING *"
        );
    }

    #[test]
    fn test_sqlite_ignores_column_types() {
        let types = pg_types();
        let stmt = build_insert(Dialect::Sqlite, Some(&types), "items", &json!({"qty": 1})).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO \"items\" (\"qty\") VALUES (?) RETURNING *");
    }
}
