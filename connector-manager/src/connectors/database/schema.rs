//! Table, column and key introspection.

use conduit::Result;
use serde_json::Value;

use super::pool::DbPool;
use super::query::{quote_ident, ColumnTypes, SqlStatement};
use crate::schema::{Capability, FieldSchema, Relation, ResourceSchema, Schema};
use crate::types::Row;

pub const CAPABILITIES: &[Capability] = &[
    Capability::Read,
    Capability::Write,
    Capability::Search,
    Capability::Aggregate,
    Capability::Transaction,
];

pub async fn introspect(pool: &DbPool, pg_schema: &str) -> Result<Schema> {
    let resources = match pool {
        DbPool::Sqlite(_) => introspect_sqlite(pool).await?,
        DbPool::Postgres(_) => introspect_postgres(pool, pg_schema).await?,
    };
    Ok(Schema {
        resources,
        capabilities: CAPABILITIES.to_vec(),
    })
}

async fn introspect_sqlite(pool: &DbPool) -> Result<Vec<ResourceSchema>> {
    let tables = fetch(
        pool,
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        vec![],
    )
    .await?;

    let mut resources = Vec::with_capacity(tables.len());
    for table in tables {
        let Some(name) = str_of(&table, "name") else {
            continue;
        };
        let quoted = quote_ident(&name)?;

        let columns = fetch(pool, &format!("PRAGMA table_info({})", quoted), vec![]).await?;
        let mut fields = Vec::with_capacity(columns.len());
        // pk holds the 1-based position within the primary key, 0 if not part of it
        let mut primary: Vec<(i64, String)> = Vec::new();
        for col in &columns {
            let Some(col_name) = str_of(col, "name") else {
                continue;
            };
            let pk_pos = int_of(col, "pk");
            if pk_pos > 0 {
                primary.push((pk_pos, col_name.clone()));
            }
            fields.push(FieldSchema {
                data_type: str_of(col, "type").unwrap_or_default().to_ascii_lowercase(),
                nullable: int_of(col, "notnull") == 0 && pk_pos == 0,
                primary_key: pk_pos > 0,
                name: col_name,
            });
        }
        primary.sort();

        let keys = fetch(pool, &format!("PRAGMA foreign_key_list({})", quoted), vec![]).await?;
        let relations = keys
            .iter()
            .filter_map(|fk| {
                Some(Relation {
                    field: str_of(fk, "from")?,
                    target_resource: str_of(fk, "table")?,
                    target_field: str_of(fk, "to").unwrap_or_else(|| "rowid".to_string()),
                })
            })
            .collect();

        resources.push(ResourceSchema {
            name,
            description: None,
            fields,
            primary_key: primary.into_iter().map(|(_, n)| n).collect(),
            relations,
        });
    }
    Ok(resources)
}

const PG_TABLES: &str = "SELECT table_name::text AS name FROM information_schema.tables \
     WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name";

const PG_COLUMNS: &str = "SELECT table_name::text AS table_name, column_name::text AS name, \
     data_type::text AS data_type, (is_nullable = 'YES') AS nullable \
     FROM information_schema.columns WHERE table_schema = $1 \
     ORDER BY table_name, ordinal_position";

const PG_PRIMARY_KEYS: &str = "SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 \
     ORDER BY kcu.table_name, kcu.ordinal_position";

const PG_FOREIGN_KEYS: &str = "SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS name, \
     ccu.table_name::text AS target_table, ccu.column_name::text AS target_column \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     JOIN information_schema.constraint_column_usage ccu \
       ON tc.constraint_name = ccu.constraint_name AND tc.table_schema = ccu.table_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1";

async fn introspect_postgres(pool: &DbPool, pg_schema: &str) -> Result<Vec<ResourceSchema>> {
    let schema_param = || vec![Value::String(pg_schema.to_string())];

    let tables = fetch(pool, PG_TABLES, schema_param()).await?;
    let columns = fetch(pool, PG_COLUMNS, schema_param()).await?;
    let primary_keys = fetch(pool, PG_PRIMARY_KEYS, schema_param()).await?;
    let foreign_keys = fetch(pool, PG_FOREIGN_KEYS, schema_param()).await?;

    let mut resources: Vec<ResourceSchema> = tables
        .iter()
        .filter_map(|t| str_of(t, "name"))
        .map(|name| ResourceSchema {
            name,
            ..ResourceSchema::default()
        })
        .collect();

    for resource in &mut resources {
        resource.primary_key = primary_keys
            .iter()
            .filter(|pk| str_of(pk, "table_name").as_deref() == Some(resource.name.as_str()))
            .filter_map(|pk| str_of(pk, "name"))
            .collect();

        resource.fields = columns
            .iter()
            .filter(|c| str_of(c, "table_name").as_deref() == Some(resource.name.as_str()))
            .filter_map(|c| {
                let name = str_of(c, "name")?;
                Some(FieldSchema {
                    primary_key: resource.primary_key.contains(&name),
                    data_type: str_of(c, "data_type").unwrap_or_default(),
                    nullable: c.get("nullable").and_then(Value::as_bool).unwrap_or(true),
                    name,
                })
            })
            .collect();

        resource.relations = foreign_keys
            .iter()
            .filter(|fk| str_of(fk, "table_name").as_deref() == Some(resource.name.as_str()))
            .filter_map(|fk| {
                Some(Relation {
                    field: str_of(fk, "name")?,
                    target_resource: str_of(fk, "target_table")?,
                    target_field: str_of(fk, "target_column")?,
                })
            })
            .collect();
    }

    Ok(resources)
}

const PG_COLUMN_TYPES: &str = "SELECT column_name::text AS name, udt_schema::text AS udt_schema, \
     udt_name::text AS udt_name FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2";

/// Declared column types of one table. `resource` may be schema-qualified.
///
/// An unknown table yields an empty map.
pub async fn pg_column_types(pool: &DbPool, pg_schema: &str, resource: &str) -> Result<ColumnTypes> {
    let (schema, table) = resource.rsplit_once('.').unwrap_or((pg_schema, resource));
    let rows = fetch(
        pool,
        PG_COLUMN_TYPES,
        vec![Value::String(schema.to_string()), Value::String(table.to_string())],
    )
    .await?;

    let mut types = ColumnTypes::with_capacity(rows.len());
    for row in &rows {
        let (Some(name), Some(udt_schema), Some(udt_name)) = (
            str_of(row, "name"),
            str_of(row, "udt_schema"),
            str_of(row, "udt_name"),
        ) else {
            continue;
        };
        types.insert(name, format!("{}.{}", quote_ident(&udt_schema)?, quote_ident(&udt_name)?));
    }
    Ok(types)
}

async fn fetch(pool: &DbPool, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
    let stmt = SqlStatement {
        sql: sql.to_string(),
        params,
        returns_rows: true,
    };
    Ok(pool.run(&stmt).await?.rows)
}

fn str_of(row: &Row, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_string)
}

fn int_of(row: &Row, key: &str) -> i64 {
    row.get(key).and_then(Value::as_i64).unwrap_or(0)
}
