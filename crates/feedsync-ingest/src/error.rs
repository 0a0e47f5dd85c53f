//! Recoverable error kinds
//!
//! None of these abort a run. Rows failing validation are skipped and
//! counted, failed batches are recorded, and a failed purge is reported.
//! Run-fatal conditions are [`feedsync_common::FeedSyncError`].

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Row-local failure: the row is skipped and counted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("line {line}: key column '{column}' is missing or blank")]
    MissingKey { line: u64, column: String },
}

/// Whether resubmitting the same call may succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// Timeout, rate limiting, dropped connection
    Transient,
    /// Schema or type rejection reported by the store
    Rejected,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErrorKind::Transient => f.write_str("transient"),
            StoreErrorKind::Rejected => f.write_str("rejected"),
        }
    }
}

/// Failure of a single store call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} store error: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }
}

/// A batch that could not be written once its retry budget was spent
#[derive(Error, Debug, Clone)]
#[error("batch {batch} ({rows} rows) failed after {attempts} attempt(s): {source}")]
pub struct WriteError {
    pub batch: u64,
    pub rows: usize,
    pub attempts: u32,
    #[source]
    pub source: StoreError,
}

/// The stale purge failed; stale rows remain until the next run
#[derive(Error, Debug, Clone)]
#[error("purge failed: {0}")]
pub struct PurgeError(#[from] pub StoreError);
