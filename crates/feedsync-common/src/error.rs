//! Error types for feedsync
//!
//! Only conditions that abort a whole run live here. Row, field, and batch
//! level failures are recoverable and are modelled in `feedsync-ingest`.

use thiserror::Error;

/// Result type alias for feedsync operations
pub type Result<T> = std::result::Result<T, FeedSyncError>;

/// Run-fatal error
#[derive(Error, Debug)]
pub enum FeedSyncError {
    /// Feed unreachable, timed out, or answered with a non-success status
    #[error("Transport error: {0}")]
    Transport(String),

    /// Feed bytes cannot be parsed as the declared format
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store could not be reached at all (connection setup, not a batch write)
    #[error("Store error: {0}")]
    Store(String),
}

impl FeedSyncError {
    /// Short machine-friendly label used in logs and run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            FeedSyncError::Transport(_) => "transport",
            FeedSyncError::Decode(_) => "decode",
            FeedSyncError::Config(_) => "config",
            FeedSyncError::Io(_) => "io",
            FeedSyncError::Store(_) => "store",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(FeedSyncError::Transport("503".into()).kind(), "transport");
        assert_eq!(FeedSyncError::Decode("bad gzip".into()).kind(), "decode");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(FeedSyncError::from(io).kind(), "io");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = FeedSyncError::Transport("status 404 Not Found".into());
        assert_eq!(err.to_string(), "Transport error: status 404 Not Found");
    }
}
