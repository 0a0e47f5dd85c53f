//! Record framing ahead of the CSV parser
//!
//! The parser treats an opening quote that is never closed as a field that
//! runs to end of input, swallowing every later line. [`RecordFramer`] reads
//! physical lines, tracks quoting across them, and only hands complete
//! logical records to the parser. A record is considered broken when
//!
//! - a quoted field is still open at end of input,
//! - a quoted field spans more than [`MAX_QUOTED_LINES`] lines, or
//! - it spans several lines and its field count differs from the header's.
//!
//! The first line of a broken record is replaced by a blank line (which the
//! parser skips, so line numbers stay aligned) and the lines after it are
//! replayed as fresh records.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};

use super::FeedBody;

const QUOTE: u8 = b'"';

/// Upper bound on the physical lines a single quoted field may span
pub const MAX_QUOTED_LINES: usize = 1000;

/// Position within a record, following the parser's default quoting rules
/// (quotes open a field only at its first byte, `""` escapes a quote)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    FieldStart,
    Unquoted,
    Quoted,
    ClosingQuote,
}

impl Quoting {
    fn advance(self, byte: u8, delimiter: u8) -> Self {
        match self {
            Quoting::Quoted if byte == QUOTE => Quoting::ClosingQuote,
            Quoting::Quoted => Quoting::Quoted,
            _ if byte == delimiter || byte == b'\n' || byte == b'\r' => Quoting::FieldStart,
            Quoting::FieldStart | Quoting::ClosingQuote if byte == QUOTE => Quoting::Quoted,
            _ => Quoting::Unquoted,
        }
    }
}

type Line = (u64, Vec<u8>);

pub struct RecordFramer {
    inner: BufReader<FeedBody>,
    delimiter: u8,
    columns: Option<usize>,
    replay: VecDeque<Line>,
    lines_read: u64,
    out: Vec<u8>,
    out_pos: usize,
    broken: Vec<u64>,
}

impl RecordFramer {
    pub fn new(body: FeedBody, delimiter: u8) -> Self {
        Self {
            inner: BufReader::new(body),
            delimiter,
            columns: None,
            replay: VecDeque::new(),
            lines_read: 0,
            out: Vec::new(),
            out_pos: 0,
            broken: Vec::new(),
        }
    }

    /// Line numbers of broken records found since the last call
    pub fn take_broken(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.broken)
    }

    fn next_line(&mut self) -> io::Result<Option<Line>> {
        if let Some(line) = self.replay.pop_front() {
            return Ok(Some(line));
        }
        let mut bytes = Vec::new();
        if self.inner.read_until(b'\n', &mut bytes)? == 0 {
            return Ok(None);
        }
        self.lines_read += 1;
        Ok(Some((self.lines_read, bytes)))
    }

    /// Fill `out` with the next logical record; leaves it empty at end of input
    fn frame_next(&mut self) -> io::Result<()> {
        let mut span: Vec<Line> = Vec::new();
        let mut state = Quoting::FieldStart;
        let mut fields = 1;

        while let Some((number, bytes)) = self.next_line()? {
            for &byte in &bytes {
                if state != Quoting::Quoted && byte == self.delimiter {
                    fields += 1;
                }
                state = state.advance(byte, self.delimiter);
            }
            span.push((number, bytes));

            if state != Quoting::Quoted {
                let has_content = span
                    .iter()
                    .any(|(_, bytes)| bytes.iter().any(|&b| b != b'\n' && b != b'\r'));
                // the first record with content is the header
                if self.columns.is_none() && has_content {
                    self.columns = Some(fields);
                }
                let expected = self.columns.unwrap_or(fields);
                if span.len() == 1 || fields == expected {
                    for (_, bytes) in span {
                        self.out.extend_from_slice(&bytes);
                    }
                    return Ok(());
                }
                break;
            }

            if span.len() >= MAX_QUOTED_LINES {
                break;
            }
        }

        let mut lines = span.into_iter();
        if let Some((number, _)) = lines.next() {
            self.broken.push(number);
            self.out.push(b'\n');
        }
        for line in lines.rev() {
            self.replay.push_front(line);
        }
        Ok(())
    }
}

impl Read for RecordFramer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.out_pos == self.out.len() {
            self.out.clear();
            self.out_pos = 0;
            self.frame_next()?;
        }
        let available = &self.out[self.out_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.out_pos += n;
        Ok(n)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framed(text: &str) -> (String, Vec<u64>) {
        let body: FeedBody = Box::new(Cursor::new(text.as_bytes().to_vec()));
        let mut framer = RecordFramer::new(body, b',');
        let mut out = String::new();
        framer.read_to_string(&mut out).unwrap();
        (out, framer.take_broken())
    }

    #[test]
    fn test_well_formed_feed_passes_through() {
        let text = "id,title\n1,\"Lamp, brass\"\n2,\"two\nlines\"\n3,\"He said \"\"hi\"\"\"\n";
        let (out, broken) = framed(text);
        assert_eq!(out, text);
        assert!(broken.is_empty());
    }

    #[test]
    fn test_quote_open_at_end_of_input_blanks_its_line() {
        let (out, broken) = framed("id,name\n1,a\n2,\"broken\n3,c\n4,d\n");
        assert_eq!(out, "id,name\n1,a\n\n3,c\n4,d\n");
        assert_eq!(broken, vec![3]);
    }

    #[test]
    fn test_quote_closed_by_a_later_line_is_resplit() {
        let (out, broken) =
            framed("id,name,price\n2,\"broken,2\n3,\"Desk, big\",3\n4,Chair,4\n");
        assert_eq!(out, "id,name,price\n\n3,\"Desk, big\",3\n4,Chair,4\n");
        assert_eq!(broken, vec![2]);
    }

    #[test]
    fn test_quote_inside_unquoted_field_is_literal() {
        let text = "id,size\n1,5\" screen\n2,7\"\n";
        let (out, broken) = framed(text);
        assert_eq!(out, text);
        assert!(broken.is_empty());
    }

    #[test]
    fn test_final_line_without_newline() {
        let (out, broken) = framed("id,name\n1,\"open");
        assert_eq!(out, "id,name\n\n");
        assert_eq!(broken, vec![2]);
    }

    #[test]
    fn test_quoted_field_longer_than_limit_is_broken() {
        let mut text = String::from("id,notes\n1,\"start\n");
        for _ in 0..MAX_QUOTED_LINES {
            text.push_str("more\n");
        }
        text.push_str("end\"\n");
        let (_, broken) = framed(&text);
        assert_eq!(broken.first(), Some(&2));
    }
}
