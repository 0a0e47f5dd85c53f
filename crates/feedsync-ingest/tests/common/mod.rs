//! Shared fixtures for the feedsync-ingest integration tests
//!
//! - [`StaticFeed`] / [`FailingFeed`]: in-process feed sources
//! - [`FlakyStore`]: a [`MemoryStore`] wrapper that injects transient
//!   failures, hangs, rejections and delays, and records how many writes
//!   were in flight when the purge started

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use feedsync_common::types::Watermark;
use feedsync_common::{FeedSyncError, Result};
use feedsync_ingest::config::{Compression, SyncConfig};
use feedsync_ingest::error::StoreError;
use feedsync_ingest::feed::{FeedBody, FeedSource};
use feedsync_ingest::models::StoreRow;
use feedsync_ingest::store::{DeleteCondition, MemoryStore, RecordStore};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub const TABLE: &str = "offers";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,feedsync_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Plain-text feed config writing to [`TABLE`]
pub fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.feed.url = "memory".into();
    config.feed.compression = Compression::None;
    config.store.table = TABLE.into();
    config.store.timeout_secs = 5;
    config.sync.retry_backoff_ms = 10;
    config
}

pub fn hours_ago(hours: i64) -> Watermark {
    Watermark::from_datetime(Utc::now() - ChronoDuration::hours(hours))
}

/// Seed a row stamped with `watermark` (or never stamped)
pub fn seed(store: &MemoryStore, key: &str, watermark: Option<Watermark>) {
    let mut row = StoreRow::new();
    row.insert("id".into(), serde_json::json!(key));
    if let Some(wm) = watermark {
        row.insert("synced_at".into(), wm.to_json());
    }
    store.seed(TABLE, key, row);
}

/// Feed built from `header` and `rows`, comma separated
pub fn csv(header: &str, rows: &[&str]) -> String {
    let mut text = format!("{}\n", header);
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    text
}

// ============================================================================
// Feed sources
// ============================================================================

pub struct StaticFeed(pub Vec<u8>);

impl StaticFeed {
    pub fn boxed(text: impl Into<String>) -> Box<dyn FeedSource> {
        Box::new(Self(text.into().into_bytes()))
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn open(&self) -> Result<FeedBody> {
        Ok(Box::new(std::io::Cursor::new(self.0.clone())))
    }

    fn describe(&self) -> String {
        format!("static ({} bytes)", self.0.len())
    }
}

pub struct FailingFeed;

#[async_trait]
impl FeedSource for FailingFeed {
    async fn open(&self) -> Result<FeedBody> {
        Err(FeedSyncError::Transport("HTTP 503 Service Unavailable".into()))
    }

    fn describe(&self) -> String {
        "failing".into()
    }
}

// ============================================================================
// Fault-injecting store
// ============================================================================

#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    transient_failures: AtomicU32,
    hangs: AtomicU32,
    reject_key: Option<String>,
    fail_delete: bool,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    upserts_started: AtomicUsize,
    delete_saw_in_flight: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` upsert calls with a transient error
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Never answer the next `n` upsert calls
    pub fn with_hangs(self, n: u32) -> Self {
        self.hangs.store(n, Ordering::SeqCst);
        self
    }

    /// Reject any upsert containing `key`
    pub fn rejecting_key(mut self, key: &str) -> Self {
        self.reject_key = Some(key.to_string());
        self
    }

    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn upserts_started(&self) -> usize {
        self.upserts_started.load(Ordering::SeqCst)
    }

    pub fn delete_saw_in_flight(&self) -> bool {
        self.delete_saw_in_flight.load(Ordering::SeqCst)
    }
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Decrements the in-flight count even when the call is cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(store: &'a FlakyStore) -> Self {
        let now = store.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        store.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(&store.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &[StoreRow],
        conflict_key: &str,
    ) -> std::result::Result<u64, StoreError> {
        self.upserts_started.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(self);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if take(&self.hangs) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if take(&self.transient_failures) {
            return Err(StoreError::transient("canceling statement due to statement timeout"));
        }
        if let Some(key) = &self.reject_key {
            let wanted = serde_json::json!(key);
            if rows.iter().any(|r| r.get(conflict_key) == Some(&wanted)) {
                return Err(StoreError::rejected("invalid input syntax for type numeric"));
            }
        }

        self.inner.upsert(table, rows, conflict_key).await
    }

    async fn delete_where(
        &self,
        table: &str,
        field: &str,
        condition: &DeleteCondition,
    ) -> std::result::Result<u64, StoreError> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.delete_saw_in_flight.store(true, Ordering::SeqCst);
        }
        if self.fail_delete {
            return Err(StoreError::transient("connection reset by peer"));
        }
        self.inner.delete_where(table, field, condition).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
