//! Store adapters
//!
//! The engine talks to the store through exactly two operations: an upsert
//! keyed on a conflict column and a conditional delete. Each backend maps
//! its own failures onto [`StoreError`] so the batch writer can tell a
//! retryable failure from a rejection.

pub mod memory;
pub mod postgres;
pub mod rest;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use rest::RestStore;

use async_trait::async_trait;
use feedsync_common::{FeedSyncError, Result};
use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;
use crate::models::StoreRow;

/// Row filter for [`RecordStore::delete_where`]
///
/// The comparison variants also match rows where the field is null, so rows
/// never stamped by any run are treated as stale.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteCondition {
    LessThan(serde_json::Value),
    NotEqual(serde_json::Value),
    /// Every row in the table
    Any,
}

/// Persistent store holding rows keyed by a unique column
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update `rows` by `conflict_key`; returns rows affected
    ///
    /// The call is all-or-nothing and resubmitting it must be harmless.
    async fn upsert(
        &self,
        table: &str,
        rows: &[StoreRow],
        conflict_key: &str,
    ) -> std::result::Result<u64, StoreError>;

    /// Delete rows whose `field` satisfies `condition`; returns rows deleted
    async fn delete_where(
        &self,
        table: &str,
        field: &str,
        condition: &DeleteCondition,
    ) -> std::result::Result<u64, StoreError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Build the configured store backend
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn RecordStore>> {
    match config.backend {
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                FeedSyncError::Config("DATABASE_URL is required for the postgres store".into())
            })?;
            let store = PostgresStore::connect(url, config.max_connections, config.timeout()).await?;
            Ok(Arc::new(store))
        },
        StoreBackend::Rest => {
            let (Some(url), Some(key)) = (config.rest_url.as_deref(), config.rest_api_key.as_deref())
            else {
                return Err(FeedSyncError::Config(
                    "FEEDSYNC_REST_URL and FEEDSYNC_REST_KEY are required for the rest store".into(),
                ));
            };
            Ok(Arc::new(RestStore::new(url, key, config.timeout())?))
        },
    }
}
