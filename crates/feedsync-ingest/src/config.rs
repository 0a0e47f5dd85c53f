//! Run configuration
//!
//! Built once at process start (environment, then CLI overrides) and handed
//! to the [`Reconciler`](crate::reconcile::Reconciler) by value.

use feedsync_common::{FeedSyncError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Rows decoded from the feed per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 5000;

/// Records per upsert call.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Retries after the first attempt for a transient batch failure.
pub const DEFAULT_WRITE_RETRIES: u32 = 1;

/// Fixed backoff between batch attempts in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2000;

/// Batches in flight at once; 1 keeps the pipeline sequential.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 1;

/// Whole-download timeout for the feed in seconds.
pub const DEFAULT_FEED_TIMEOUT_SECS: u64 = 600;

/// Per store call timeout in seconds.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 60;

/// Database pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

pub const DEFAULT_TABLE: &str = "feed_records";
pub const DEFAULT_KEY_SOURCE_COLUMN: &str = "aw_product_id";
pub const DEFAULT_KEY_FIELD: &str = "id";
pub const DEFAULT_WATERMARK_FIELD: &str = "synced_at";

// ============================================================================
// Enumerated options
// ============================================================================

/// Compression applied to the feed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

/// How a run treats rows the feed no longer lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Delete every stored row once the feed is open, then upsert
    ReplaceAll,
    /// Upsert only; rows dropped by the feed are kept
    UpsertOnly,
    /// Upsert, then delete rows whose watermark predates this run
    #[default]
    UpsertAndPurgeStale,
}

/// Comparison used by the stale purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeComparison {
    /// `watermark < run watermark`; monotonic across runs
    #[default]
    LessThan,
    /// `watermark <> run watermark`; also removes rows stamped by a later run
    NotEqual,
}

/// Store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgres,
    /// PostgREST / Supabase REST endpoint
    Rest,
}

macro_rules! option_enum_text {
    ($ty:ty, $what:literal, { $($variant:path => [$canonical:literal $(, $alias:literal)*]),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = FeedSyncError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().replace('-', "_").as_str() {
                    $($canonical $(| $alias)* => Ok($variant),)+
                    other => Err(FeedSyncError::Config(format!(
                        concat!("invalid ", $what, ": '{}'"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($variant => f.write_str($canonical),)+
                }
            }
        }
    };
}

option_enum_text!(Compression, "compression", {
    Compression::None => ["none", "plain", "identity"],
    Compression::Gzip => ["gzip", "gz"],
});

option_enum_text!(RunMode, "run mode", {
    RunMode::ReplaceAll => ["replace_all", "truncate"],
    RunMode::UpsertOnly => ["upsert_only", "upsert"],
    RunMode::UpsertAndPurgeStale => ["upsert_and_purge_stale", "purge_stale", "sync"],
});

option_enum_text!(PurgeComparison, "purge comparison", {
    PurgeComparison::LessThan => ["less_than", "lt"],
    PurgeComparison::NotEqual => ["not_equal", "neq"],
});

option_enum_text!(StoreBackend, "store backend", {
    StoreBackend::Postgres => ["postgres", "postgresql", "pg"],
    StoreBackend::Rest => ["rest", "postgrest", "supabase"],
});

// ============================================================================
// Configuration sections
// ============================================================================

/// Complete configuration for one reconciliation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    pub feed: FeedConfig,
    pub store: StoreConfig,
    pub sync: ReconcileConfig,
}

/// Where the feed comes from and how it is encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// `http(s)://` URL or a local path
    pub url: String,
    pub compression: Compression,
    pub delimiter: u8,
    pub chunk_size: usize,
    pub timeout_secs: u64,
}

/// Target store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub rest_url: Option<String>,
    #[serde(skip_serializing)]
    pub rest_api_key: Option<String>,
    pub table: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Normalization, batching, and purge policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Feed column the unique key is copied from
    pub key_source_column: String,
    /// Store column used as the upsert conflict target
    pub key_field: String,
    /// Store column carrying the run watermark
    pub watermark_field: String,
    /// Feed columns coerced to numbers
    pub numeric_fields: Vec<String>,
    pub batch_size: usize,
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
    pub write_concurrency: usize,
    pub mode: RunMode,
    pub purge_comparison: PurgeComparison,
    /// Stop dispatching batches and fail the run after the first failed batch
    pub abort_on_write_error: bool,
    /// Exit non-zero when a run completes with errors
    pub fail_on_partial: bool,
    /// Run the stale purge even when no row was written
    pub purge_on_empty: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            compression: Compression::default(),
            delimiter: b',',
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: DEFAULT_FEED_TIMEOUT_SECS,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            rest_url: None,
            rest_api_key: None,
            table: DEFAULT_TABLE.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            key_source_column: DEFAULT_KEY_SOURCE_COLUMN.to_string(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            watermark_field: DEFAULT_WATERMARK_FIELD.to_string(),
            numeric_fields: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            write_retries: DEFAULT_WRITE_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            mode: RunMode::default(),
            purge_comparison: PurgeComparison::default(),
            abort_on_write_error: false,
            fail_on_partial: false,
            purge_on_empty: false,
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StoreConfig {
    /// Check the connection settings the selected backend needs
    pub fn validate_backend(&self) -> Result<()> {
        match self.backend {
            StoreBackend::Postgres => {
                if self.database_url.is_none() {
                    return Err(FeedSyncError::Config(
                        "DATABASE_URL is required for the postgres store".into(),
                    ));
                }
                if self.max_connections == 0 {
                    return Err(FeedSyncError::Config(
                        "max connections must be greater than 0".into(),
                    ));
                }
            },
            StoreBackend::Rest => {
                if self.rest_url.is_none() || self.rest_api_key.is_none() {
                    return Err(FeedSyncError::Config(
                        "FEEDSYNC_REST_URL and FEEDSYNC_REST_KEY are required for the rest store"
                            .into(),
                    ));
                }
            },
        }
        Ok(())
    }
}

impl ReconcileConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// First set variable among `names`
fn env_any(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| FeedSyncError::Config(format!("{}: {}", name, e))),
        _ => Ok(None),
    }
}

/// Parse a delimiter given as a single character or as `tab` / `\t`
pub fn parse_delimiter(raw: &str) -> Result<u8> {
    match raw {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        "pipe" => Ok(b'|'),
        s if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        s => Err(FeedSyncError::Config(format!(
            "delimiter must be a single ASCII character, got '{}'",
            s
        ))),
    }
}

/// Split a comma-separated column list, dropping blanks
pub fn parse_field_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl SyncConfig {
    /// Load configuration from `.env` and environment variables
    ///
    /// Feed: `FEEDSYNC_FEED_URL` (or `AWIN_FEED_URL`), `FEEDSYNC_COMPRESSION`,
    /// `FEEDSYNC_DELIMITER`, `FEEDSYNC_CHUNK_SIZE`, `FEEDSYNC_FEED_TIMEOUT_SECS`.
    ///
    /// Store: `FEEDSYNC_STORE` (postgres|rest), `DATABASE_URL`,
    /// `FEEDSYNC_REST_URL` (or `SUPABASE_URL`), `FEEDSYNC_REST_KEY` (or
    /// `SUPABASE_KEY`), `FEEDSYNC_TABLE`, `FEEDSYNC_MAX_CONNECTIONS`,
    /// `FEEDSYNC_STORE_TIMEOUT_SECS`.
    ///
    /// Sync: `FEEDSYNC_KEY_SOURCE_COLUMN`, `FEEDSYNC_KEY_FIELD`,
    /// `FEEDSYNC_WATERMARK_FIELD`, `FEEDSYNC_NUMERIC_FIELDS`,
    /// `FEEDSYNC_BATCH_SIZE`, `FEEDSYNC_WRITE_RETRIES`,
    /// `FEEDSYNC_RETRY_BACKOFF_MS`, `FEEDSYNC_WRITE_CONCURRENCY`,
    /// `FEEDSYNC_MODE`, `FEEDSYNC_PURGE_COMPARISON`,
    /// `FEEDSYNC_ABORT_ON_WRITE_ERROR`, `FEEDSYNC_FAIL_ON_PARTIAL`,
    /// `FEEDSYNC_PURGE_ON_EMPTY`.
    ///
    /// The result is not validated; call [`SyncConfig::validate`] after
    /// applying any CLI overrides.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Some(url) = env_any(&["FEEDSYNC_FEED_URL", "AWIN_FEED_URL"]) {
            config.feed.url = url;
        }
        if let Some(c) = env_parse("FEEDSYNC_COMPRESSION")? {
            config.feed.compression = c;
        }
        if let Some(d) = env_any(&["FEEDSYNC_DELIMITER"]) {
            config.feed.delimiter = parse_delimiter(&d)?;
        }
        if let Some(n) = env_parse("FEEDSYNC_CHUNK_SIZE")? {
            config.feed.chunk_size = n;
        }
        if let Some(n) = env_parse("FEEDSYNC_FEED_TIMEOUT_SECS")? {
            config.feed.timeout_secs = n;
        }

        if let Some(b) = env_parse("FEEDSYNC_STORE")? {
            config.store.backend = b;
        }
        config.store.database_url = env_any(&["FEEDSYNC_DATABASE_URL", "DATABASE_URL"]);
        config.store.rest_url = env_any(&["FEEDSYNC_REST_URL", "SUPABASE_URL"]);
        config.store.rest_api_key = env_any(&["FEEDSYNC_REST_KEY", "SUPABASE_KEY"]);
        if let Some(table) = env_any(&["FEEDSYNC_TABLE"]) {
            config.store.table = table;
        }
        if let Some(n) = env_parse("FEEDSYNC_MAX_CONNECTIONS")? {
            config.store.max_connections = n;
        }
        if let Some(n) = env_parse("FEEDSYNC_STORE_TIMEOUT_SECS")? {
            config.store.timeout_secs = n;
        }

        let sync = &mut config.sync;
        if let Some(col) = env_any(&["FEEDSYNC_KEY_SOURCE_COLUMN"]) {
            sync.key_source_column = col;
        }
        if let Some(field) = env_any(&["FEEDSYNC_KEY_FIELD"]) {
            sync.key_field = field;
        }
        if let Some(field) = env_any(&["FEEDSYNC_WATERMARK_FIELD"]) {
            sync.watermark_field = field;
        }
        if let Some(fields) = env_any(&["FEEDSYNC_NUMERIC_FIELDS"]) {
            sync.numeric_fields = parse_field_list(&fields);
        }
        if let Some(n) = env_parse("FEEDSYNC_BATCH_SIZE")? {
            sync.batch_size = n;
        }
        if let Some(n) = env_parse("FEEDSYNC_WRITE_RETRIES")? {
            sync.write_retries = n;
        }
        if let Some(n) = env_parse("FEEDSYNC_RETRY_BACKOFF_MS")? {
            sync.retry_backoff_ms = n;
        }
        if let Some(n) = env_parse("FEEDSYNC_WRITE_CONCURRENCY")? {
            sync.write_concurrency = n;
        }
        if let Some(mode) = env_parse("FEEDSYNC_MODE")? {
            sync.mode = mode;
        }
        if let Some(cmp) = env_parse("FEEDSYNC_PURGE_COMPARISON")? {
            sync.purge_comparison = cmp;
        }
        if let Some(flag) = env_parse("FEEDSYNC_ABORT_ON_WRITE_ERROR")? {
            sync.abort_on_write_error = flag;
        }
        if let Some(flag) = env_parse("FEEDSYNC_FAIL_ON_PARTIAL")? {
            sync.fail_on_partial = flag;
        }
        if let Some(flag) = env_parse("FEEDSYNC_PURGE_ON_EMPTY")? {
            sync.purge_on_empty = flag;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_pipeline()?;
        self.store.validate_backend()
    }

    /// Validate everything except the store backend's connection settings
    pub fn validate_pipeline(&self) -> Result<()> {
        if self.feed.url.trim().is_empty() {
            return Err(FeedSyncError::Config(
                "feed URL is required (FEEDSYNC_FEED_URL or --feed-url)".into(),
            ));
        }
        if self.feed.chunk_size == 0 {
            return Err(FeedSyncError::Config("chunk size must be greater than 0".into()));
        }
        if self.feed.timeout_secs == 0 {
            return Err(FeedSyncError::Config("feed timeout must be greater than 0".into()));
        }
        if matches!(self.feed.delimiter, b'"' | b'\n' | b'\r') {
            return Err(FeedSyncError::Config(
                "delimiter cannot be a quote or line terminator".into(),
            ));
        }

        if self.store.table.trim().is_empty() {
            return Err(FeedSyncError::Config("target table cannot be empty".into()));
        }
        if self.store.timeout_secs == 0 {
            return Err(FeedSyncError::Config("store timeout must be greater than 0".into()));
        }

        let sync = &self.sync;
        if sync.key_source_column.trim().is_empty() || sync.key_field.trim().is_empty() {
            return Err(FeedSyncError::Config("key columns cannot be empty".into()));
        }
        if sync.watermark_field.trim().is_empty() {
            return Err(FeedSyncError::Config("watermark field cannot be empty".into()));
        }
        if sync.watermark_field.trim() == sync.key_field.trim() {
            return Err(FeedSyncError::Config(
                "watermark field and key field must differ".into(),
            ));
        }
        if sync.batch_size == 0 {
            return Err(FeedSyncError::Config("batch size must be greater than 0".into()));
        }
        if sync.write_concurrency == 0 {
            return Err(FeedSyncError::Config(
                "write concurrency must be greater than 0".into(),
            ));
        }
        if sync.numeric_fields.iter().any(|f| f.trim() == sync.key_source_column.trim()) {
            tracing::warn!(
                column = %sync.key_source_column,
                "Key source column is declared numeric; the key is still taken verbatim"
            );
        }

        Ok(())
    }
}
