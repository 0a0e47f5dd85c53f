//! Core types for a reconciliation run

use feedsync_common::types::{FieldValue, Watermark};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::RunMode;

/// One row as the store sees it: column name to JSON value
pub type StoreRow = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Feed rows
// ============================================================================

/// One decoded feed line
///
/// Values are positional against a header shared by every row of the feed.
/// Empty cells are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    line: u64,
    header: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl RawRow {
    pub fn new(line: u64, header: Arc<[String]>, values: Vec<Option<String>>) -> Self {
        Self {
            line,
            header,
            values,
        }
    }

    /// Build a row from `(column, value)` pairs; empty strings become `None`
    pub fn from_pairs<'a>(line: u64, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let (names, values): (Vec<String>, Vec<Option<String>>) = pairs
            .into_iter()
            .map(|(k, v)| {
                let value = if v.is_empty() { None } else { Some(v.to_string()) };
                (k.to_string(), value)
            })
            .unzip();
        Self::new(line, names.into(), values)
    }

    /// 1-based record number in the feed, header excluded
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn header(&self) -> &Arc<[String]> {
        &self.header
    }

    /// Value for `column`, matched exactly against the raw header name
    pub fn get(&self, column: &str) -> Option<&str> {
        self.header
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
            .and_then(|v| v.as_deref())
    }

    /// `(column, value)` pairs in feed order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.header
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(|v| v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// Normalized records and batches
// ============================================================================

/// A row in canonical typed form, stamped with its run's watermark
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub key: String,
    pub fields: Vec<(String, FieldValue)>,
    pub watermark: Watermark,
    /// Numeric fields that failed coercion and were nulled
    pub nulled_fields: usize,
}

impl NormalizedRecord {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(name, _)| name == field).map(|(_, v)| v)
    }

    /// Store representation with the watermark written to `watermark_field`
    pub fn to_store_row(&self, watermark_field: &str) -> StoreRow {
        let mut row = StoreRow::new();
        for (name, value) in &self.fields {
            row.insert(name.clone(), value.to_json());
        }
        row.insert(watermark_field.to_string(), self.watermark.to_json());
        row
    }
}

/// Records sent to the store in one upsert call
///
/// A key seen twice keeps its last occurrence: a single upsert statement
/// cannot touch the same conflict key twice.
#[derive(Debug, Clone)]
pub struct Batch {
    pub number: u64,
    records: Vec<NormalizedRecord>,
    positions: HashMap<String, usize>,
}

impl Batch {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            records: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Add a record; returns `true` if it replaced one with the same key
    pub fn push(&mut self, record: NormalizedRecord) -> bool {
        match self.positions.get(&record.key) {
            Some(&idx) => {
                self.records[idx] = record;
                true
            },
            None => {
                self.positions.insert(record.key.clone(), self.records.len());
                self.records.push(record);
                false
            },
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn to_store_rows(&self, watermark_field: &str) -> Vec<StoreRow> {
        self.records
            .iter()
            .map(|r| r.to_store_row(watermark_field))
            .collect()
    }
}

// ============================================================================
// Run state
// ============================================================================

/// Reconciler state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Downloading,
    Processing,
    Purging,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// How a finished run is reported to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    CompletedWithErrors,
    Failed,
}

/// Aggregate counters shared by concurrent batch writers
#[derive(Debug, Default)]
pub struct RunCounters {
    pub rows_read: AtomicU64,
    pub rows_written: AtomicU64,
    pub rows_failed: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub rows_malformed: AtomicU64,
    pub rows_deduplicated: AtomicU64,
    pub fields_nulled: AtomicU64,
    pub batches_written: AtomicU64,
    pub batches_failed: AtomicU64,
}

impl RunCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// One reconciliation run; owned and mutated only by the reconciler
#[derive(Debug)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub watermark: Watermark,
    pub mode: RunMode,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub counters: Arc<RunCounters>,
    pub rows_purged: Option<u64>,
    pub purge_error: Option<String>,
    pub purge_skipped: bool,
    pub fatal_error: Option<String>,
    started: Instant,
}

impl SyncRun {
    /// Start a run; the watermark is fixed here for the run's lifetime
    pub fn start(mode: RunMode) -> Self {
        Self::with_watermark(mode, Watermark::now())
    }

    pub fn with_watermark(mode: RunMode, watermark: Watermark) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            watermark,
            mode,
            phase: RunPhase::Init,
            status: RunStatus::Running,
            counters: Arc::new(RunCounters::default()),
            rows_purged: None,
            purge_error: None,
            purge_skipped: false,
            fatal_error: None,
            started: Instant::now(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let c = &self.counters;
        let rows_failed = RunCounters::get(&c.rows_failed);
        let batches_failed = RunCounters::get(&c.batches_failed);

        let outcome = match self.status {
            RunStatus::Failed => RunOutcome::Failed,
            _ if rows_failed > 0
                || batches_failed > 0
                || self.purge_error.is_some()
                || self.purge_skipped =>
            {
                RunOutcome::CompletedWithErrors
            },
            _ => RunOutcome::Success,
        };

        RunSummary {
            run_id: self.run_id,
            watermark: self.watermark.to_iso8601(),
            mode: self.mode.to_string(),
            phase: self.phase,
            outcome,
            rows_read: RunCounters::get(&c.rows_read),
            rows_written: RunCounters::get(&c.rows_written),
            rows_failed,
            rows_skipped: RunCounters::get(&c.rows_skipped),
            rows_malformed: RunCounters::get(&c.rows_malformed),
            rows_deduplicated: RunCounters::get(&c.rows_deduplicated),
            fields_nulled: RunCounters::get(&c.fields_nulled),
            batches_written: RunCounters::get(&c.batches_written),
            batches_failed,
            rows_purged: self.rows_purged,
            purge_error: self.purge_error.clone(),
            fatal_error: self.fatal_error.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Operator-facing result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub watermark: String,
    pub mode: String,
    pub phase: RunPhase,
    pub outcome: RunOutcome,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_failed: u64,
    pub rows_skipped: u64,
    pub rows_malformed: u64,
    pub rows_deduplicated: u64,
    pub fields_nulled: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub rows_purged: Option<u64>,
    pub purge_error: Option<String>,
    pub fatal_error: Option<String>,
    pub duration_ms: u64,
}
