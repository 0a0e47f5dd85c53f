//! Feedsync Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Reconciles a database table with a full snapshot of a delimited feed.
//! Every row the feed lists is upserted and stamped with the run's
//! watermark; once all batches have settled, rows carrying an older
//! watermark are deleted.
//!
//! # Components
//!
//! - [`feed`]: transports and the chunked CSV/TSV decoder
//! - [`normalize`]: key derivation and numeric coercion
//! - [`writer`]: batched idempotent upserts with bounded retry
//! - [`purge`]: the watermark mark-and-sweep delete
//! - [`reconcile`]: the run state machine tying them together
//! - [`store`]: PostgreSQL, PostgREST and in-memory backends
//!
//! # Example
//!
//! ```no_run
//! use feedsync_ingest::config::SyncConfig;
//! use feedsync_ingest::{feed, store, Reconciler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig::from_env()?;
//!     config.validate()?;
//!
//!     let source = feed::source_for(&config.feed.url, config.feed.timeout())?;
//!     let store = store::connect(&config.store).await?;
//!     let summary = Reconciler::new(config, source, store).run().await;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod feed;
pub mod models;
pub mod normalize;
pub mod purge;
pub mod reconcile;
pub mod store;
pub mod writer;

pub use config::SyncConfig;
pub use models::{RunOutcome, RunSummary};
pub use reconcile::Reconciler;
