//! End-to-end reconciliation runs against in-memory stores
//!
//! Covers the run state machine, batch failure containment, the completion
//! barrier before the purge, and each run mode.

use chrono::Utc;
use feedsync_common::types::{FieldValue, Watermark};
use feedsync_ingest::config::{PurgeComparison, RunMode};
use feedsync_ingest::models::RunPhase;
use feedsync_ingest::store::MemoryStore;
use feedsync_ingest::{Reconciler, RunOutcome};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{config, csv, hours_ago, init_tracing, seed, FailingFeed, FlakyStore, StaticFeed, TABLE};

const HEADER: &str = "aw_product_id,product_name,search_price,zipcode";

// ============================================================================
// Baseline scenarios
// ============================================================================

#[tokio::test]
async fn test_three_valid_rows_replace_prior_contents() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "9", Some(hours_ago(24)));

    let feed = csv(HEADER, &["1,Lamp,10.5,N1", "2,Desk,99,N2", "3,Chair,45,N3"]);
    let summary = Reconciler::new(config(), StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_read, 3);
    assert_eq!(summary.rows_written, 3);
    assert_eq!(summary.rows_failed, 0);
    assert_eq!(summary.rows_purged, Some(1));
    assert_eq!(store.keys(TABLE), vec!["1", "2", "3"]);
}

#[tokio::test]
async fn test_row_with_empty_key_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let feed = csv(HEADER, &["1,Lamp,10,N1", ",Ghost,5,N2", "3,Chair,45,N3"]);
    let summary = Reconciler::new(config(), StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_skipped, 1);
    assert_eq!(summary.rows_written, 2);
    assert_eq!(store.keys(TABLE), vec!["1", "3"]);
}

#[tokio::test]
async fn test_non_numeric_zipcode_is_written_as_null() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config();
    cfg.sync.numeric_fields = vec!["search_price".into(), "zipcode".into()];

    let feed = csv(HEADER, &["1,Lamp, 12.50 ,SW1A 1AA"]);
    let summary = Reconciler::new(cfg, StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.fields_nulled, 1);

    let row = store.get(TABLE, "1").unwrap();
    assert_eq!(row["zipcode"], json!(null));
    assert_eq!(row["search_price"], json!(12.5));
    assert_eq!(row["id"], json!("1"));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_batch_is_retried_once_then_recorded() {
    init_tracing();
    let store = Arc::new(FlakyStore::new().with_hangs(2));
    let mut cfg = config();
    cfg.sync.batch_size = 1;
    cfg.store.timeout_secs = 1;

    let feed = csv(HEADER, &["1,Lamp,1,A", "2,Desk,2,B"]);
    let summary = Reconciler::new(cfg, StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(summary.phase, RunPhase::Completed);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.rows_failed, 1);
    assert_eq!(summary.rows_written, 1);
    // two attempts for batch 1, one for batch 2
    assert_eq!(store.upserts_started(), 3);
    assert_eq!(store.inner.keys(TABLE), vec!["2"]);
}

#[tokio::test]
async fn test_transport_failure_fails_run_without_purge() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "old", Some(hours_ago(1)));

    let summary = Reconciler::new(config(), Box::new(FailingFeed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.phase, RunPhase::Failed);
    assert_eq!(summary.rows_written, 0);
    assert_eq!(summary.rows_purged, None);
    assert!(summary.fatal_error.unwrap().contains("503"));
    assert_eq!(store.upsert_calls(), 0);
    assert_eq!(store.delete_calls(), 0);
    assert_eq!(store.len(TABLE), 1);
}

// ============================================================================
// Invariants
// ============================================================================

#[tokio::test]
async fn test_rerun_is_idempotent_and_restamps() {
    let store = Arc::new(MemoryStore::new());
    let feed = csv(HEADER, &["1,Lamp,1,A", "2,Desk,2,B"]);
    let reconciler = Reconciler::new(config(), StaticFeed::boxed(feed), store.clone());

    let first = Watermark::from_datetime(Utc::now() - chrono::Duration::minutes(5));
    reconciler.run_with_watermark(first).await;
    let keys_after_first = store.keys(TABLE);

    let second = Watermark::now();
    let summary = reconciler.run_with_watermark(second).await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_purged, Some(0));
    assert_eq!(store.keys(TABLE), keys_after_first);
    for row in store.rows(TABLE) {
        assert_eq!(row["synced_at"], second.to_json());
    }
}

#[tokio::test]
async fn test_no_stale_watermark_survives_purge() {
    let store = Arc::new(MemoryStore::new());
    for key in ["a", "b", "c"] {
        seed(&store, key, Some(hours_ago(2)));
    }
    seed(&store, "never-stamped", None);

    let feed = csv(HEADER, &["b,Desk,2,B", "d,Shelf,3,C"]);
    let watermark = Watermark::now();
    let summary = Reconciler::new(config(), StaticFeed::boxed(feed), store.clone())
        .run_with_watermark(watermark)
        .await;

    assert_eq!(summary.rows_purged, Some(3));
    assert_eq!(store.keys(TABLE), vec!["b", "d"]);
    for row in store.rows(TABLE) {
        assert_eq!(row["synced_at"], watermark.to_json());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_purge_waits_for_every_dispatched_batch() {
    init_tracing();
    let store = Arc::new(FlakyStore::new().with_delay(Duration::from_millis(20)));
    let mut cfg = config();
    cfg.sync.batch_size = 2;
    cfg.sync.write_concurrency = 4;

    let rows: Vec<String> = (0..40).map(|i| format!("{i},Item {i},{i},Z")).collect();
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    let summary = Reconciler::new(cfg, StaticFeed::boxed(csv(HEADER, &rows)), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.batches_written, 20);
    assert_eq!(summary.rows_written, 40);
    assert!(store.max_in_flight() > 1);
    assert!(store.max_in_flight() <= 4);
    assert!(!store.delete_saw_in_flight());
    assert_eq!(store.inner.len(TABLE), 40);
}

#[tokio::test]
async fn test_rejected_batch_does_not_block_later_batches_or_purge() {
    let store = Arc::new(FlakyStore::new().rejecting_key("2"));
    seed(&store.inner, "stale", Some(hours_ago(3)));
    let mut cfg = config();
    cfg.sync.batch_size = 1;

    let feed = csv(HEADER, &["1,A,1,A", "2,B,2,B", "3,C,3,C"]);
    let summary = Reconciler::new(cfg, StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.rows_purged, Some(1));
    assert_eq!(store.inner.keys(TABLE), vec!["1", "3"]);
}

#[tokio::test]
async fn test_malformed_lines_are_counted_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    let feed = csv(HEADER, &["1,A,1,A", "2,too,few", "3,C,3,C,extra", "4,D,4,D"]);
    let summary = Reconciler::new(config(), StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_malformed, 2);
    assert_eq!(summary.rows_read, 2);
    assert_eq!(store.keys(TABLE), vec!["1", "4"]);
}

#[tokio::test]
async fn test_unterminated_quote_keeps_later_rows_out_of_purge() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "3", Some(hours_ago(24)));
    seed(&store, "4", Some(hours_ago(24)));

    let feed = csv(
        HEADER,
        &["1,Lamp,1,A", "2,\"Broken quote,2,B", "3,Desk,3,C", "4,Chair,4,D"],
    );
    let summary = Reconciler::new(config(), StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_malformed, 1);
    assert_eq!(summary.rows_read, 3);
    assert_eq!(summary.rows_written, 3);
    assert_eq!(summary.rows_purged, Some(0));
    assert_eq!(store.keys(TABLE), vec!["1", "3", "4"]);
}

// ============================================================================
// Policies and run modes
// ============================================================================

#[tokio::test]
async fn test_failed_purge_is_reported_not_fatal() {
    let store = Arc::new(FlakyStore::new().failing_delete());
    let summary = Reconciler::new(config(), StaticFeed::boxed(csv(HEADER, &["1,A,1,A"])), store)
        .run()
        .await;

    assert_eq!(summary.phase, RunPhase::Completed);
    assert_eq!(summary.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(summary.rows_written, 1);
    assert!(summary.purge_error.is_some());
    assert_eq!(summary.rows_purged, None);
}

#[tokio::test]
async fn test_abort_on_write_error_stops_and_skips_purge() {
    let store = Arc::new(FlakyStore::new().rejecting_key("1"));
    seed(&store.inner, "stale", Some(hours_ago(3)));
    let mut cfg = config();
    cfg.sync.batch_size = 1;
    cfg.sync.abort_on_write_error = true;

    let feed = csv(HEADER, &["1,A,1,A", "2,B,2,B", "3,C,3,C", "4,D,4,D"]);
    let summary = Reconciler::new(cfg, StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.phase, RunPhase::Failed);
    assert!(store.upserts_started() < 4);
    assert_eq!(summary.rows_purged, None);
    assert!(store.inner.get(TABLE, "stale").is_some());
}

#[tokio::test]
async fn test_upsert_only_keeps_dropped_rows() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "dropped", Some(hours_ago(5)));
    let mut cfg = config();
    cfg.sync.mode = RunMode::UpsertOnly;

    let summary = Reconciler::new(cfg, StaticFeed::boxed(csv(HEADER, &["1,A,1,A"])), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_purged, None);
    assert_eq!(store.delete_calls(), 0);
    assert_eq!(store.keys(TABLE), vec!["1", "dropped"]);
}

#[tokio::test]
async fn test_replace_all_clears_table_first() {
    let store = Arc::new(MemoryStore::new());
    // stamped in the future: the stale purge would keep it
    seed(&store, "future", Some(Watermark::from_datetime(Utc::now() + chrono::Duration::hours(1))));
    seed(&store, "old", Some(hours_ago(1)));
    let mut cfg = config();
    cfg.sync.mode = RunMode::ReplaceAll;

    let summary = Reconciler::new(cfg, StaticFeed::boxed(csv(HEADER, &["1,A,1,A"])), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_purged, Some(2));
    assert_eq!(store.keys(TABLE), vec!["1"]);
}

#[tokio::test]
async fn test_replace_all_keeps_table_when_feed_is_unreachable() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "kept", Some(hours_ago(1)));
    let mut cfg = config();
    cfg.sync.mode = RunMode::ReplaceAll;

    let summary = Reconciler::new(cfg, Box::new(FailingFeed), store.clone()).run().await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(store.keys(TABLE), vec!["kept"]);
}

#[tokio::test]
async fn test_empty_feed_skips_purge_unless_enabled() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "kept", Some(hours_ago(1)));

    let summary = Reconciler::new(config(), StaticFeed::boxed(csv(HEADER, &[])), store.clone())
        .run()
        .await;
    assert_eq!(summary.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(summary.rows_purged, None);
    assert_eq!(store.len(TABLE), 1);

    let mut cfg = config();
    cfg.sync.purge_on_empty = true;
    let summary = Reconciler::new(cfg, StaticFeed::boxed(csv(HEADER, &[])), store.clone())
        .run()
        .await;
    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.rows_purged, Some(1));
    assert!(store.is_empty(TABLE));
}

#[tokio::test]
async fn test_not_equal_comparison_removes_later_stamps() {
    let store = Arc::new(MemoryStore::new());
    let watermark = Watermark::now();
    let later = Watermark::from_datetime(watermark.as_datetime() + chrono::Duration::seconds(30));
    seed(&store, "later", Some(later));

    let mut cfg = config();
    cfg.sync.purge_comparison = PurgeComparison::NotEqual;
    let summary = Reconciler::new(cfg, StaticFeed::boxed(csv(HEADER, &["1,A,1,A"])), store.clone())
        .run_with_watermark(watermark)
        .await;

    assert_eq!(summary.rows_purged, Some(1));
    assert_eq!(store.keys(TABLE), vec!["1"]);
}

#[tokio::test]
async fn test_tab_delimited_feed_with_padded_header() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config();
    cfg.feed.delimiter = b'\t';
    cfg.sync.numeric_fields = vec!["price".into()];

    let feed = " aw_product_id \tname\tprice \n7\tRoom\t1 200\n";
    let summary = Reconciler::new(cfg, StaticFeed::boxed(feed), store.clone())
        .run()
        .await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    let row = store.get(TABLE, "7").unwrap();
    assert_eq!(row["price"], FieldValue::from(1200i64).to_json());
    assert_eq!(row["name"], json!("Room"));
}
