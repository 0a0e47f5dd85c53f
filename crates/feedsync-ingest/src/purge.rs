//! Stale record purge
//!
//! After every batch of a run has settled, any stored row whose watermark
//! predates the run's (or is null) is no longer listed by the feed and is
//! deleted in one call. Failures are reported, never retried: the next
//! successful run removes whatever this one left behind.

use feedsync_common::types::Watermark;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::PurgeComparison;
use crate::error::{PurgeError, StoreError};
use crate::store::{DeleteCondition, RecordStore};

pub struct StaleRecordPurger {
    store: Arc<dyn RecordStore>,
    table: String,
    watermark_field: String,
    comparison: PurgeComparison,
    timeout: Duration,
}

impl StaleRecordPurger {
    pub fn new(
        store: Arc<dyn RecordStore>,
        table: impl Into<String>,
        watermark_field: impl Into<String>,
        comparison: PurgeComparison,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            watermark_field: watermark_field.into().trim().to_string(),
            comparison,
            timeout,
        }
    }

    /// Delete rows not stamped with `watermark`; returns rows deleted
    pub async fn purge(&self, watermark: Watermark) -> Result<u64, PurgeError> {
        let bound = watermark.to_json();
        let condition = match self.comparison {
            PurgeComparison::LessThan => DeleteCondition::LessThan(bound),
            PurgeComparison::NotEqual => DeleteCondition::NotEqual(bound),
        };

        let deleted = self.delete(&condition).await?;
        info!(
            table = %self.table,
            watermark = %watermark,
            comparison = %self.comparison,
            deleted,
            "Stale rows purged"
        );
        Ok(deleted)
    }

    /// Delete every row in the table
    pub async fn purge_all(&self) -> Result<u64, PurgeError> {
        let deleted = self.delete(&DeleteCondition::Any).await?;
        info!(table = %self.table, deleted, "Table cleared");
        Ok(deleted)
    }

    async fn delete(&self, condition: &DeleteCondition) -> Result<u64, PurgeError> {
        let call = self
            .store
            .delete_where(&self.table, &self.watermark_field, condition);

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::transient(format!(
                "delete timed out after {:?}",
                self.timeout
            ))),
        };

        result.map_err(|e| {
            warn!(table = %self.table, error = %e, "Purge failed; stale rows remain until the next run");
            PurgeError(e)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::StoreRow;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn stamped(id: &str, wm: Option<Watermark>) -> StoreRow {
        let mut row = StoreRow::new();
        row.insert("id".into(), json!(id));
        if let Some(wm) = wm {
            row.insert("synced_at".into(), wm.to_json());
        }
        row
    }

    fn purger(store: Arc<MemoryStore>, comparison: PurgeComparison) -> StaleRecordPurger {
        StaleRecordPurger::new(store, "t", "synced_at", comparison, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_purge_keeps_only_current_run() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let old = Watermark::from_datetime(now - ChronoDuration::hours(1));
        let current = Watermark::from_datetime(now);

        store.seed("t", "old", stamped("old", Some(old)));
        store.seed("t", "null", stamped("null", None));
        store.seed("t", "cur", stamped("cur", Some(current)));

        let deleted = purger(store.clone(), PurgeComparison::LessThan)
            .purge(current)
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(store.keys("t"), vec!["cur".to_string()]);
    }

    #[tokio::test]
    async fn test_less_than_spares_later_runs() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let current = Watermark::from_datetime(now);
        let later = Watermark::from_datetime(now + ChronoDuration::seconds(5));
        store.seed("t", "later", stamped("later", Some(later)));

        let p = purger(store.clone(), PurgeComparison::LessThan);
        assert_eq!(p.purge(current).await.unwrap(), 0);

        let p = purger(store.clone(), PurgeComparison::NotEqual);
        assert_eq!(p.purge(current).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_all() {
        let store = Arc::new(MemoryStore::new());
        store.seed("t", "a", stamped("a", Some(Watermark::now())));
        store.seed("t", "b", stamped("b", None));
        assert_eq!(purger(store.clone(), PurgeComparison::LessThan).purge_all().await.unwrap(), 2);
        assert!(store.is_empty("t"));
    }
}
