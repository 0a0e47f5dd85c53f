//! Feed access: fetching the raw bytes and decoding them into rows
//!
//! [`FeedSource`] is the transport seam; [`FeedReader`] turns the body it
//! returns into chunks of [`RawRow`](crate::models::RawRow).

mod frame;
pub mod reader;
pub mod source;

pub use reader::{FeedFormat, FeedReader};
pub use source::{source_for, FeedSource, FileFeedSource, HttpFeedSource};

use std::io::Read;

/// Undecoded feed bytes, possibly compressed
pub type FeedBody = Box<dyn Read + Send>;
