//! Batch writer
//!
//! Sends one [`Batch`] as a single upsert call. Transient failures are
//! retried with a fixed backoff; rejections are not. A batch that still
//! fails is reported back to the caller and never aborts the run by itself.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::ReconcileConfig;
use crate::error::{StoreError, WriteError};
use crate::models::Batch;
use crate::store::RecordStore;

/// Retry budget and per-call timeout for batch writes
#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    /// Attempts after the first one
    pub retries: u32,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl WritePolicy {
    pub fn new(retries: u32, backoff: Duration, call_timeout: Duration) -> Self {
        Self {
            retries,
            backoff,
            call_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Result of writing one batch
#[derive(Debug)]
pub struct BatchReport {
    pub batch: u64,
    pub accepted: usize,
    pub rejected: usize,
    pub attempts: u32,
    pub error: Option<WriteError>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct BatchWriter {
    store: Arc<dyn RecordStore>,
    table: String,
    key_field: String,
    watermark_field: String,
    policy: WritePolicy,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        table: impl Into<String>,
        config: &ReconcileConfig,
        policy: WritePolicy,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            key_field: config.key_field.trim().to_string(),
            watermark_field: config.watermark_field.trim().to_string(),
            policy,
        }
    }

    /// Write `batch` all-or-nothing
    pub async fn write(&self, batch: &Batch) -> BatchReport {
        let rows = batch.to_store_rows(&self.watermark_field);
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.attempt(&rows).await {
                Ok(affected) => {
                    debug!(
                        batch = batch.number,
                        rows = rows.len(),
                        affected,
                        attempts,
                        "Batch written"
                    );
                    return BatchReport {
                        batch: batch.number,
                        accepted: rows.len(),
                        rejected: 0,
                        attempts,
                        error: None,
                    };
                },
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    warn!(
                        batch = batch.number,
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Batch write failed, will retry"
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                },
                Err(e) => {
                    error!(
                        batch = batch.number,
                        rows = rows.len(),
                        attempts,
                        kind = %e.kind,
                        error = %e.message,
                        "Batch write failed permanently"
                    );
                    return BatchReport {
                        batch: batch.number,
                        accepted: 0,
                        rejected: rows.len(),
                        attempts,
                        error: Some(WriteError {
                            batch: batch.number,
                            rows: rows.len(),
                            attempts,
                            source: e,
                        }),
                    };
                },
            }
        }
    }

    async fn attempt(&self, rows: &[crate::models::StoreRow]) -> Result<u64, StoreError> {
        let call = self.store.upsert(&self.table, rows, &self.key_field);
        match tokio::time::timeout(self.policy.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::transient(format!(
                "upsert timed out after {:?}",
                self.policy.call_timeout
            ))),
        }
    }
}
