//! Feedsync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the feedsync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: run-fatal error kinds and the crate `Result` alias
//! - **Types**: the typed field values and run watermark shared by the
//!   normalizer and every store backend
//! - **Logging**: `tracing` subscriber setup for the binaries
//!
//! # Example
//!
//! ```no_run
//! use feedsync_common::types::{FieldValue, Watermark};
//!
//! let watermark = Watermark::now();
//! let price = FieldValue::number(12.5);
//! println!("{} {:?}", watermark, price);
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{FeedSyncError, Result};
