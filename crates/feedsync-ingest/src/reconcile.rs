//! Run orchestration
//!
//! ```text
//! Init -> Downloading -> Processing -> Purging -> Completed
//!              |              |
//!              +--> Failed <--+   (fatal feed error, or abort-on-write-error)
//! ```
//!
//! Feed decoding runs on the blocking pool one chunk at a time. Batches are
//! written by a bounded set of tasks that update the run counters
//! themselves; every dispatched write is joined before the purge starts.

use feedsync_common::types::Watermark;
use feedsync_common::{FeedSyncError, Result};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{RunMode, SyncConfig};
use crate::feed::{FeedFormat, FeedReader, FeedSource};
use crate::models::{Batch, RawRow, RunCounters, RunPhase, RunStatus, RunSummary, SyncRun};
use crate::normalize::{NormalizationSchema, RecordNormalizer};
use crate::purge::StaleRecordPurger;
use crate::store::RecordStore;
use crate::writer::{BatchReport, BatchWriter, WritePolicy};

/// Log the first few skipped rows at warn, the rest at debug
const SKIPPED_WARN_LIMIT: u64 = 10;

/// How the processing phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Finished,
    /// A batch failed with `abort_on_write_error` set
    Aborted,
}

pub struct Reconciler {
    config: SyncConfig,
    source: Box<dyn FeedSource>,
    store: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(config: SyncConfig, source: Box<dyn FeedSource>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            config,
            source,
            store,
        }
    }

    /// Run one reconciliation stamped with the current time
    pub async fn run(&self) -> RunSummary {
        self.run_with_watermark(Watermark::now()).await
    }

    /// Run one reconciliation stamped with `watermark`
    pub async fn run_with_watermark(&self, watermark: Watermark) -> RunSummary {
        let run = SyncRun::with_watermark(self.config.sync.mode, watermark);
        let span = info_span!(
            "sync_run",
            run_id = %run.run_id,
            table = %self.config.store.table
        );
        self.execute(run).instrument(span).await
    }

    async fn execute(&self, mut run: SyncRun) -> RunSummary {
        info!(
            watermark = %run.watermark,
            mode = %run.mode,
            source = %self.source.describe(),
            store = self.store.name(),
            "Starting sync run"
        );

        if let Err(e) = self.drive(&mut run).await {
            error!(kind = e.kind(), error = %e, "Sync run failed");
            run.fatal_error = Some(e.to_string());
            fail(&mut run);
        }

        let summary = run.summary();
        info!(
            outcome = ?summary.outcome,
            rows_read = summary.rows_read,
            rows_written = summary.rows_written,
            rows_failed = summary.rows_failed,
            rows_skipped = summary.rows_skipped,
            rows_malformed = summary.rows_malformed,
            rows_purged = ?summary.rows_purged,
            batches_failed = summary.batches_failed,
            duration_ms = summary.duration_ms,
            "Sync run finished"
        );
        summary
    }

    async fn drive(&self, run: &mut SyncRun) -> Result<()> {
        enter(run, RunPhase::Downloading);
        let body = self.source.open().await?;

        let format = FeedFormat::from(&self.config.feed);
        let chunk_size = self.config.feed.chunk_size;
        let reader = blocking(move || FeedReader::open(body, format, chunk_size)).await??;
        info!(columns = reader.header().len(), "Feed opened");

        let purger = self.purger();

        // only once the feed is known to be readable
        if run.mode == RunMode::ReplaceAll {
            let deleted = purger.purge_all().await.map_err(|e| {
                FeedSyncError::Store(format!("cannot clear table before replace: {}", e))
            })?;
            run.rows_purged = Some(deleted);
        }

        enter(run, RunPhase::Processing);
        if self.process(run, reader).await? == Processed::Aborted {
            run.fatal_error = Some("aborted after a batch write failed".into());
            fail(run);
            return Ok(());
        }

        if run.mode == RunMode::UpsertAndPurgeStale {
            enter(run, RunPhase::Purging);
            self.purge_stale(run, &purger).await;
        }

        run.status = RunStatus::Completed;
        enter(run, RunPhase::Completed);
        Ok(())
    }

    /// Decode, normalize, and write the whole feed; returns once every
    /// dispatched batch has settled
    async fn process(&self, run: &SyncRun, reader: FeedReader) -> Result<Processed> {
        let mut in_flight = JoinSet::new();
        let pumped = self.pump(run, reader, &mut in_flight).await;

        match pumped {
            Err(e) => {
                // nothing may be purged after a partial read
                in_flight.shutdown().await;
                Err(e)
            },
            Ok(mut outcome) => {
                while let Some(joined) = in_flight.join_next().await {
                    if !settle(joined, &run.counters) && self.config.sync.abort_on_write_error {
                        outcome = Processed::Aborted;
                    }
                }
                Ok(outcome)
            },
        }
    }

    async fn pump(
        &self,
        run: &SyncRun,
        mut reader: FeedReader,
        in_flight: &mut JoinSet<BatchReport>,
    ) -> Result<Processed> {
        let sync = &self.config.sync;
        let counters = &run.counters;
        let normalizer = RecordNormalizer::new(NormalizationSchema::from(sync), reader.header());
        let writer = Arc::new(self.writer());
        let concurrency = sync.write_concurrency.max(1);

        let mut batch = Batch::new(1);

        loop {
            let (returned, chunk) = blocking(move || {
                let chunk = reader.next_chunk();
                (reader, chunk)
            })
            .await?;
            reader = returned;

            let rows = match chunk {
                Ok(Some(rows)) => rows,
                Ok(None) => break,
                Err(e) => {
                    RunCounters::add(&counters.rows_malformed, reader.rows_malformed());
                    return Err(e);
                },
            };

            RunCounters::add(&counters.rows_read, rows.len() as u64);
            debug!(rows = rows.len(), total = reader.rows_decoded(), "Feed chunk decoded");

            for row in rows {
                if !self.normalize_into(&normalizer, &row, run.watermark, &mut batch, counters) {
                    continue;
                }
                if batch.len() >= sync.batch_size {
                    let next = Batch::new(batch.number + 1);
                    let full = std::mem::replace(&mut batch, next);
                    if self.dispatch(full, &writer, in_flight, counters, concurrency).await
                        == Processed::Aborted
                    {
                        RunCounters::add(&counters.rows_malformed, reader.rows_malformed());
                        return Ok(Processed::Aborted);
                    }
                }
            }
        }

        RunCounters::add(&counters.rows_malformed, reader.rows_malformed());

        if !batch.is_empty() {
            return Ok(self.dispatch(batch, &writer, in_flight, counters, concurrency).await);
        }
        Ok(Processed::Finished)
    }

    /// Returns `false` if the row was skipped
    fn normalize_into(
        &self,
        normalizer: &RecordNormalizer,
        row: &RawRow,
        watermark: Watermark,
        batch: &mut Batch,
        counters: &RunCounters,
    ) -> bool {
        match normalizer.normalize(row, watermark) {
            Ok(record) => {
                RunCounters::add(&counters.fields_nulled, record.nulled_fields as u64);
                if batch.push(record) {
                    RunCounters::add(&counters.rows_deduplicated, 1);
                }
                true
            },
            Err(e) => {
                RunCounters::add(&counters.rows_skipped, 1);
                if RunCounters::get(&counters.rows_skipped) <= SKIPPED_WARN_LIMIT {
                    warn!(error = %e, "Skipping row");
                } else {
                    debug!(error = %e, "Skipping row");
                }
                false
            },
        }
    }

    /// Hand `batch` to a writer task, first waiting for a free slot
    async fn dispatch(
        &self,
        batch: Batch,
        writer: &Arc<BatchWriter>,
        in_flight: &mut JoinSet<BatchReport>,
        counters: &Arc<RunCounters>,
        concurrency: usize,
    ) -> Processed {
        while in_flight.len() >= concurrency {
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            if !settle(joined, counters) && self.config.sync.abort_on_write_error {
                warn!(batch = batch.number, "Not dispatching further batches after a write failure");
                return Processed::Aborted;
            }
        }

        debug!(batch = batch.number, rows = batch.len(), "Dispatching batch");
        let writer = Arc::clone(writer);
        let counters = Arc::clone(counters);
        in_flight.spawn(
            async move {
                let report = writer.write(&batch).await;
                record(&counters, &report);
                report
            }
            .in_current_span(),
        );
        Processed::Finished
    }

    async fn purge_stale(&self, run: &mut SyncRun, purger: &StaleRecordPurger) {
        let written = RunCounters::get(&run.counters.rows_written);
        if written == 0 && !self.config.sync.purge_on_empty {
            warn!("No rows were written; skipping the stale purge");
            run.purge_skipped = true;
            return;
        }

        match purger.purge(run.watermark).await {
            Ok(deleted) => run.rows_purged = Some(deleted),
            Err(e) => run.purge_error = Some(e.to_string()),
        }
    }

    fn writer(&self) -> BatchWriter {
        let sync = &self.config.sync;
        let policy = WritePolicy::new(
            sync.write_retries,
            sync.retry_backoff(),
            self.config.store.timeout(),
        );
        BatchWriter::new(Arc::clone(&self.store), self.config.store.table.clone(), sync, policy)
    }

    fn purger(&self) -> StaleRecordPurger {
        StaleRecordPurger::new(
            Arc::clone(&self.store),
            self.config.store.table.clone(),
            self.config.sync.watermark_field.clone(),
            self.config.sync.purge_comparison,
            self.config.store.timeout(),
        )
    }
}

fn enter(run: &mut SyncRun, phase: RunPhase) {
    info!(from = ?run.phase, to = ?phase, "Run phase change");
    run.phase = phase;
}

fn fail(run: &mut SyncRun) {
    run.status = RunStatus::Failed;
    enter(run, RunPhase::Failed);
}

/// Fold a finished batch into the run counters
fn record(counters: &RunCounters, report: &BatchReport) {
    if report.is_success() {
        RunCounters::add(&counters.rows_written, report.accepted as u64);
        RunCounters::add(&counters.batches_written, 1);
    } else {
        RunCounters::add(&counters.rows_failed, report.rejected as u64);
        RunCounters::add(&counters.batches_failed, 1);
    }
}

/// Returns `false` if the batch failed
fn settle(joined: std::result::Result<BatchReport, JoinError>, counters: &RunCounters) -> bool {
    match joined {
        Ok(report) => report.is_success(),
        Err(e) => {
            // the task never reached `record`
            error!(error = %e, "Batch writer task did not complete");
            RunCounters::add(&counters.batches_failed, 1);
            false
        },
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FeedSyncError::Io(std::io::Error::other(e)))
}
