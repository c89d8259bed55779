//! Store adapter over existing PostgreSQL tables.
//!
//! Each entity kind maps to one table whose identity column holds the
//! record identity. Rows are read as `to_jsonb(t)` and written through
//! `jsonb_populate_record`, so column types are resolved by the database
//! instead of being declared twice.

use crate::adapters::{now_millis, AdapterError, Result, StateSink, StateSource};
use async_trait::async_trait;
use converge_engine::{
    EntityKind, EntitySchema, FieldMap, Filter, Identity, Origin, Predicate, Record, Snapshot,
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashMap;

/// A fetched row rendered as one JSON object.
#[derive(Debug)]
pub struct JsonRow {
    pub row: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JsonRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(JsonRow {
            row: row.try_get("row")?,
        })
    }
}

/// Adapter over a PostgreSQL database.
pub struct PgAdapter {
    name: String,
    pool: PgPool,
    tables: HashMap<EntityKind, String>,
}

impl PgAdapter {
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
            tables: HashMap::new(),
        }
    }

    /// Map an entity kind to a table (optionally schema-qualified).
    /// Unmapped kinds use a table named after the kind.
    pub fn with_table(mut self, kind: impl Into<EntityKind>, table: impl Into<String>) -> Self {
        self.tables.insert(kind.into(), table.into());
        self
    }

    fn table(&self, schema: &EntitySchema) -> Result<String> {
        let table = self
            .tables
            .get(&schema.kind)
            .map(String::as_str)
            .unwrap_or(schema.kind.as_str());
        quote_ident(table)
    }
}

/// Quote an identifier, allowing one level of schema qualification.
pub fn quote_ident(name: &str) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| !is_plain_ident(p)) {
        return Err(AdapterError::NotConfigured(format!(
            "invalid SQL identifier: {name:?}"
        )));
    }
    Ok(parts
        .iter()
        .map(|p| format!("\"{p}\""))
        .collect::<Vec<_>>()
        .join("."))
}

fn is_plain_ident(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn column_list(columns: &[&String]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

/// Text form of a filter value, matching what `->>` yields.
fn text_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the fetch query. Equality and membership predicates are pushed
/// down; containment is evaluated after the fetch.
fn select_query(
    table: &str,
    identity_field: &str,
    filter: &Filter,
) -> Result<QueryBuilder<'static, Postgres>> {
    let mut query = QueryBuilder::new("SELECT to_jsonb(t) AS row FROM ");
    query.push(table).push(" t");

    let mut first = true;
    for predicate in &filter.predicates {
        let keyword = if first { " WHERE " } else { " AND " };
        match predicate {
            Predicate::Eq { field, value } => {
                query.push(keyword).push("(to_jsonb(t) ->> ");
                query.push_bind(field.clone()).push(") = ");
                query.push_bind(text_of(value));
            }
            Predicate::In { field, values } => {
                query.push(keyword).push("(to_jsonb(t) ->> ");
                query.push_bind(field.clone()).push(") = ANY(");
                query.push_bind(values.iter().map(text_of).collect::<Vec<_>>());
                query.push(")");
            }
            Predicate::Contains { .. } => continue,
        }
        first = false;
    }

    query
        .push(" ORDER BY t.")
        .push(quote_ident(identity_field)?);
    Ok(query)
}

fn insert_sql(table: &str, columns: &[&String]) -> Result<String> {
    let columns = column_list(columns)?;
    Ok(format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)"
    ))
}

fn update_sql(table: &str, columns: &[&String], identity_field: &str) -> Result<String> {
    let columns = column_list(columns)?;
    let identity = quote_ident(identity_field)?;
    Ok(format!(
        "UPDATE {table} SET ({columns}) = (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)) WHERE {identity}::text = $2"
    ))
}

fn delete_sql(table: &str, identity_field: &str) -> Result<String> {
    let identity = quote_ident(identity_field)?;
    Ok(format!("DELETE FROM {table} WHERE {identity}::text = $1"))
}

/// Map a database error onto the transient/permanent split.
pub fn classify(err: sqlx::Error) -> AdapterError {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let transient = code.starts_with("08")
                || code.starts_with("40")
                || code.starts_with("53")
                || code == "57014"
                || code == "57P01";
            if transient {
                AdapterError::Unavailable(format!("{code}: {}", db.message()))
            } else {
                AdapterError::Rejected(format!("{code}: {}", db.message()))
            }
        }
        sqlx::Error::PoolTimedOut => AdapterError::Timeout,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => AdapterError::Unavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            AdapterError::Malformed(err.to_string())
        }
        other => AdapterError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl StateSource for PgAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        schema: &EntitySchema,
        filter: &Filter,
        origin: Origin,
    ) -> Result<Snapshot> {
        let table = self.table(schema)?;
        let captured_at = now_millis();
        let mut query = select_query(&table, &schema.identity_field, filter)?;
        let rows = query
            .build_query_as::<JsonRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        let mut records = Vec::with_capacity(rows.len());
        for JsonRow { row } in rows {
            let record = schema.record(row)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }

        tracing::debug!(origin = %self.name, %table, records = records.len(), "fetched table");
        Ok(Snapshot::new(schema.kind.clone(), origin, captured_at, records)?)
    }
}

#[async_trait]
impl StateSink for PgAdapter {
    fn as_source(&self) -> &dyn StateSource {
        self
    }

    async fn apply_create(&self, schema: &EntitySchema, record: &Record) -> Result<()> {
        let table = self.table(schema)?;
        let columns: Vec<&String> = record.fields.keys().collect();
        sqlx::query(&insert_sql(&table, &columns)?)
            .bind(serde_json::Value::Object(record.fields.clone()))
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn apply_update(
        &self,
        schema: &EntitySchema,
        identity: &Identity,
        changed: &FieldMap,
    ) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        let table = self.table(schema)?;
        let columns: Vec<&String> = changed.keys().collect();
        let result = sqlx::query(&update_sql(&table, &columns, &schema.identity_field)?)
            .bind(serde_json::Value::Object(changed.clone()))
            .bind(identity.as_str())
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(AdapterError::Rejected(format!(
                "{} {identity} not found",
                schema.kind
            )));
        }
        Ok(())
    }

    async fn apply_delete(&self, schema: &EntitySchema, identity: &Identity) -> Result<()> {
        let table = self.table(schema)?;
        sqlx::query(&delete_sql(&table, &schema.identity_field)?)
            .bind(identity.as_str())
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn independent_creates(&self, schema: &EntitySchema) -> bool {
        schema.independent_creates
    }
}
