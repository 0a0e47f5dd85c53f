//! PostgreSQL store
//!
//! Each batch is one statement: the rows travel as a single JSONB array and
//! `jsonb_populate_recordset` casts every value to the target column's type,
//! so the engine never has to know the table schema.

use async_trait::async_trait;
use feedsync_common::{FeedSyncError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

use super::{DeleteCondition, RecordStore};
use crate::error::StoreError;
use crate::models::StoreRow;

/// SQLSTATE codes worth retrying
const TRANSIENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "53300", // too_many_connections
    "55P03", // lock_not_available
    "57014", // query_canceled (statement_timeout)
    "57P01", // admin_shutdown
];

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| FeedSyncError::Store(format!("failed to connect to database: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Quote an identifier; a dotted name is treated as `schema.table`
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.trim().replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn quote_column(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Columns in first-seen order across all rows
fn column_union(rows: &[StoreRow]) -> Vec<&str> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for name in row.keys() {
            if !columns.contains(&name.as_str()) {
                columns.push(name);
            }
        }
    }
    columns
}

/// Build the upsert statement for `columns`
pub fn upsert_sql(table: &str, columns: &[&str], conflict_key: &str) -> String {
    let table = quote_ident(table);
    let column_list = columns
        .iter()
        .map(|c| quote_column(c))
        .collect::<Vec<_>>()
        .join(", ");

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != conflict_key)
        .map(|c| {
            let q = quote_column(c);
            format!("{q} = EXCLUDED.{q}")
        })
        .collect();

    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({key}) {on_conflict}",
        key = quote_column(conflict_key),
    )
}

/// Build the delete statement; `$1` is a one-field JSON object holding the
/// bound so it is cast to the column's own type
pub fn delete_sql(table: &str, field: &str, condition: &DeleteCondition) -> String {
    let table_q = quote_ident(table);
    let field_q = quote_column(field);
    let bound = format!("(SELECT {field_q} FROM jsonb_populate_record(NULL::{table_q}, $1))");

    match condition {
        DeleteCondition::Any => format!("DELETE FROM {table_q}"),
        DeleteCondition::LessThan(_) => {
            format!("DELETE FROM {table_q} WHERE {field_q} IS NULL OR {field_q} < {bound}")
        },
        DeleteCondition::NotEqual(_) => {
            format!("DELETE FROM {table_q} WHERE {field_q} IS NULL OR {field_q} <> {bound}")
        },
    }
}

/// Map a driver error onto the retry taxonomy
pub fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code.as_str()) {
                StoreError::transient(format!("{} (SQLSTATE {})", db.message(), code))
            } else {
                StoreError::rejected(format!("{} (SQLSTATE {})", db.message(), code))
            }
        },
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::transient(err.to_string()),
        _ => StoreError::rejected(err.to_string()),
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &[StoreRow],
        conflict_key: &str,
    ) -> std::result::Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = column_union(rows);
        if !columns.contains(&conflict_key) {
            return Err(StoreError::rejected(format!(
                "rows have no conflict column \"{}\"",
                conflict_key
            )));
        }

        let sql = upsert_sql(table, &columns, conflict_key);
        let payload = serde_json::Value::Array(
            rows.iter().cloned().map(serde_json::Value::Object).collect(),
        );

        let result = sqlx::query(&sql)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        debug!(table, rows = rows.len(), affected = result.rows_affected(), "Upsert executed");
        Ok(result.rows_affected())
    }

    async fn delete_where(
        &self,
        table: &str,
        field: &str,
        condition: &DeleteCondition,
    ) -> std::result::Result<u64, StoreError> {
        let sql = delete_sql(table, field, condition);
        let query = sqlx::query(&sql);
        let query = match condition {
            DeleteCondition::Any => query,
            DeleteCondition::LessThan(bound) | DeleteCondition::NotEqual(bound) => {
                let mut param = StoreRow::new();
                param.insert(field.to_string(), bound.clone());
                query.bind(serde_json::Value::Object(param))
            },
        };

        let result = query.execute(&self.pool).await.map_err(classify)?;
        Ok(result.rows_affected())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
