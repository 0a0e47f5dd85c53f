//! Feed transports
//!
//! The HTTP source spools the body to an anonymous temp file while it
//! downloads, so memory use does not grow with the feed size and decoding
//! never holds a network connection open.

use async_trait::async_trait;
use feedsync_common::{FeedSyncError, Result};
use futures::StreamExt;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use super::FeedBody;

/// Log download progress every this many bytes
const PROGRESS_LOG_BYTES: u64 = 64 * 1024 * 1024;

/// Something that can produce the raw feed bytes
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Open the feed. Any error here is fatal for the run.
    async fn open(&self) -> Result<FeedBody>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Pick a source from a URL or path
///
/// `http://` and `https://` go over the network; `file://` URLs and bare
/// paths are read from disk.
pub fn source_for(location: &str, timeout: Duration) -> Result<Box<dyn FeedSource>> {
    let location = location.trim();
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpFeedSource::new(location, timeout)?))
    } else {
        let path = location.strip_prefix("file://").unwrap_or(location);
        Ok(Box::new(FileFeedSource::new(path)))
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Downloads the feed with a single GET
pub struct HttpFeedSource {
    client: reqwest::Client,
    url: String,
}

impl HttpFeedSource {
    /// `timeout` bounds the whole request, body included
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedSyncError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn open(&self) -> Result<FeedBody> {
        info!(url = %self.url, "Downloading feed");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FeedSyncError::Transport(format!("request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedSyncError::Transport(format!(
                "download of {} failed with status {}",
                self.url, status
            )));
        }

        let expected = response.content_length();
        let mut spool = tempfile::tempfile()?;
        let mut downloaded = 0u64;
        let mut next_report = PROGRESS_LOG_BYTES;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                FeedSyncError::Transport(format!("download interrupted after {} bytes: {}", downloaded, e))
            })?;
            spool.write_all(&chunk)?;
            downloaded += chunk.len() as u64;

            if downloaded >= next_report {
                info!(downloaded, expected = ?expected, "Download progress");
                next_report += PROGRESS_LOG_BYTES;
            }
        }

        spool.flush()?;
        spool.seek(SeekFrom::Start(0))?;
        info!(bytes = downloaded, "Feed downloaded");

        Ok(Box::new(BufReader::new(spool)))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

// ============================================================================
// Local file
// ============================================================================

/// Reads a feed already on disk
pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for FileFeedSource {
    async fn open(&self) -> Result<FeedBody> {
        debug!(path = %self.path.display(), "Opening feed file");
        let file = std::fs::File::open(&self.path).map_err(|e| {
            FeedSyncError::Transport(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
