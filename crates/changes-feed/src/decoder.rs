//! Newline-delimited JSON decoding over an arbitrarily chunked byte stream.
//!
//! Lines are split on `\n` at the byte level; a newline byte never occurs
//! inside a multi-byte UTF-8 sequence, so chunk boundaries that cut through
//! a character are harmless.

use serde_json::Value;
use tracing::debug;

/// One complete line of the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// Blank line, sent by the server as a heartbeat.
    Empty,
    /// Parsed JSON value.
    Value(Value),
}

/// Incremental line decoder for a single response.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Bytes held back waiting for a line terminator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every line it completes.
    ///
    /// Lines that are neither blank nor valid JSON are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let tail = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);

        complete[..last_newline]
            .split(|&b| b == b'\n')
            .filter_map(parse_line)
            .collect()
    }

    /// Drain the unterminated tail, salvaging it if it holds a JSON value.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_slice(trimmed) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, bytes = trimmed.len(), "Discarding unparseable tail");
                None
            }
        }
    }
}

fn parse_line(line: &[u8]) -> Option<Line> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Some(Line::Empty);
    }
    match serde_json::from_slice(trimmed) {
        Ok(value) => Some(Line::Value(value)),
        Err(e) => {
            debug!(error = %e, bytes = trimmed.len(), "Dropping malformed line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn decode_all(chunks: &[&[u8]]) -> Vec<Line> {
        let mut decoder = LineDecoder::new();
        chunks.iter().flat_map(|chunk| decoder.push(chunk)).collect()
    }

    #[test]
    fn whole_lines() {
        let lines = decode_all(&[b"{\"seq\":1}\n{\"seq\":2}\n"]);
        assert_eq!(
            lines,
            vec![Line::Value(json!({"seq": 1})), Line::Value(json!({"seq": 2}))]
        );
    }

    #[test]
    fn line_split_across_chunks() {
        let lines = decode_all(&[b"{\"se", b"q\":1", b"}\n"]);
        assert_eq!(lines, vec![Line::Value(json!({"seq": 1}))]);
    }

    #[test]
    fn blank_line_is_empty() {
        let lines = decode_all(&[b"{\"seq\":1}\n\n{\"seq\":2}\n"]);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], Line::Empty);
    }

    #[test]
    fn malformed_line_is_dropped_without_losing_the_rest() {
        let lines = decode_all(&[b"garbage\n{\"seq\":3}\n"]);
        assert_eq!(lines, vec![Line::Value(json!({"seq": 3}))]);
    }

    #[test]
    fn carriage_returns_are_trimmed() {
        let lines = decode_all(&[b"{\"seq\":1}\r\n\r\n"]);
        assert_eq!(lines, vec![Line::Value(json!({"seq": 1})), Line::Empty]);
    }

    #[test]
    fn partial_tail_waits_for_terminator() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"seq\":1}").is_empty());
        assert_eq!(decoder.pending(), 9);
    }

    #[test]
    fn finish_salvages_complete_tail() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"{\"seq\":1}\n{\"last_seq\":1} ");
        assert_eq!(decoder.finish(), Some(json!({"last_seq": 1})));
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn finish_discards_truncated_tail() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"{\"seq\":");
        assert_eq!(decoder.finish(), None);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let line = "{\"name\":\"caf\u{e9}\"}\n".as_bytes();
        let (a, b) = line.split_at(13);
        let lines = decode_all(&[a, b]);
        assert_eq!(lines, vec![Line::Value(json!({"name": "caf\u{e9}"}))]);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_output(cuts in proptest::collection::vec(0usize..120, 0..12)) {
            let stream: &[u8] =
                b"{\"seq\":1,\"doc\":{\"a\":1}}\n\nnoise\n{\"seq\":2}\r\n{\"seq\":3,\"last_seq\":3}\n";
            let expected = decode_all(&[stream]);

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(stream.len())).collect();
            cuts.sort_unstable();
            let mut chunks = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&stream[start..cut]);
                start = cut;
            }
            chunks.push(&stream[start..]);

            prop_assert_eq!(decode_all(&chunks), expected);
        }
    }
}
