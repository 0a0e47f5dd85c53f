//! Streaming delimited-text decoder
//!
//! Wraps the body in a gzip decoder when configured, reads the header
//! eagerly, then hands out rows in chunks of a fixed size. Lines whose
//! column count does not match the header, and lines opening a quote that is
//! never closed, are skipped and counted. I/O and decompression failures are
//! fatal.

use feedsync_common::{FeedSyncError, Result};
use flate2::read::MultiGzDecoder;
use std::sync::Arc;
use tracing::{debug, warn};

use super::frame::RecordFramer;
use super::FeedBody;
use crate::config::{Compression, FeedConfig};
use crate::models::RawRow;

/// A header narrower than this means the feed is not in the declared format
const MIN_HEADER_COLUMNS: usize = 2;

/// Log the first few malformed lines at warn, the rest at debug
const MALFORMED_WARN_LIMIT: u64 = 10;

/// Declared encoding of the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedFormat {
    pub compression: Compression,
    pub delimiter: u8,
}

impl Default for FeedFormat {
    fn default() -> Self {
        Self {
            compression: Compression::Gzip,
            delimiter: b',',
        }
    }
}

impl From<&FeedConfig> for FeedFormat {
    fn from(config: &FeedConfig) -> Self {
        Self {
            compression: config.compression,
            delimiter: config.delimiter,
        }
    }
}

/// Lazy, non-restartable sequence of row chunks
pub struct FeedReader {
    reader: csv::Reader<RecordFramer>,
    header: Arc<[String]>,
    chunk_size: usize,
    record: csv::ByteRecord,
    rows_decoded: u64,
    rows_malformed: u64,
    finished: bool,
}

impl FeedReader {
    /// Start decoding `body`; fails fast if the header cannot be read or has
    /// fewer than two columns
    pub fn open(body: FeedBody, format: FeedFormat, chunk_size: usize) -> Result<Self> {
        let body: FeedBody = match format.compression {
            Compression::Gzip => Box::new(MultiGzDecoder::new(body)),
            Compression::None => body,
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(format.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(RecordFramer::new(body, format.delimiter));

        let header: Vec<String> = reader
            .byte_headers()
            .map_err(|e| FeedSyncError::Decode(format!("cannot read feed header: {}", e)))?
            .iter()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect();

        if header.len() < MIN_HEADER_COLUMNS {
            return Err(FeedSyncError::Decode(format!(
                "feed header has {} column(s); expected at least {} with delimiter {:?}",
                header.len(),
                MIN_HEADER_COLUMNS,
                format.delimiter as char
            )));
        }

        debug!(columns = header.len(), "Feed header decoded");

        Ok(Self {
            reader,
            header: header.into(),
            chunk_size: chunk_size.max(1),
            record: csv::ByteRecord::new(),
            rows_decoded: 0,
            rows_malformed: 0,
            finished: false,
        })
    }

    /// Column names exactly as they appear in the feed
    pub fn header(&self) -> &Arc<[String]> {
        &self.header
    }

    /// Well-formed rows handed out so far
    pub fn rows_decoded(&self) -> u64 {
        self.rows_decoded
    }

    /// Lines skipped for having the wrong column count or unterminated quoting
    pub fn rows_malformed(&self) -> u64 {
        self.rows_malformed
    }

    /// Next chunk of up to `chunk_size` rows, or `None` at end of feed
    pub fn next_chunk(&mut self) -> Result<Option<Vec<RawRow>>> {
        if self.finished {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.chunk_size);

        while rows.len() < self.chunk_size {
            let read = self.reader.read_byte_record(&mut self.record);
            for line in self.reader.get_mut().take_broken() {
                self.note_malformed(Some(line), "unterminated quoted field");
            }

            match read {
                Ok(true) => {},
                Ok(false) => {
                    self.finished = true;
                    break;
                },
                Err(e) if e.is_io_error() => {
                    self.finished = true;
                    return Err(FeedSyncError::Decode(format!(
                        "feed stream failed after {} rows: {}",
                        self.rows_decoded, e
                    )));
                },
                Err(e) => {
                    self.note_malformed(None, &e.to_string());
                    continue;
                },
            }

            let line = self.record.position().map(|p| p.line());

            if self.record.len() != self.header.len() {
                let detail = format!(
                    "expected {} columns, found {}",
                    self.header.len(),
                    self.record.len()
                );
                self.note_malformed(line, &detail);
                continue;
            }

            self.rows_decoded += 1;
            let values = self
                .record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(field).into_owned())
                    }
                })
                .collect();

            rows.push(RawRow::new(self.rows_decoded, Arc::clone(&self.header), values));
        }

        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows))
        }
    }

    fn note_malformed(&mut self, line: Option<u64>, detail: &str) {
        self.rows_malformed += 1;
        if self.rows_malformed <= MALFORMED_WARN_LIMIT {
            warn!(line = ?line, detail, "Skipping malformed feed line");
        } else {
            debug!(line = ?line, detail, "Skipping malformed feed line");
        }
    }
}

impl Iterator for FeedReader {
    type Item = Result<Vec<RawRow>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
