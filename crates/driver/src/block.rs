//! Framed content blocks emitted by the runner
//!
//! A block is a run of `Header: value` lines followed by payload content,
//! terminated by a line ending in `#EOF`. When a `Content-Length` header is
//! seen, the payload is read as exactly that many raw bytes rather than
//! line by line, so binary data may contain embedded newlines.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::warn;

/// One logical unit of runner output, accumulated line by line.
#[derive(Debug, Default)]
pub struct ContentBlock {
    pub content_type: Option<String>,
    pub encoding: Option<String>,
    pub content_hash: Option<String>,
    pub content_length: Option<usize>,

    /// Raw payload bytes. Text output is usually UTF-8 but is treated as
    /// binary until decoded.
    pub content: Vec<u8>,

    decoded: Option<Vec<u8>>,

    pub malloc: Option<f64>,
    pub js_heap: Option<f64>,
}

impl ContentBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line into the block. Returns the payload size when
    /// this line set `Content-Length`, in which case the caller must read
    /// that many raw bytes from the same stream before resuming line reads.
    ///
    /// Headers are first-occurrence-wins; a repeated header line, like any
    /// unrecognized line, is appended verbatim to the content.
    pub fn process_line(&mut self, line: &[u8]) -> Option<usize> {
        let length_before = self.content_length;
        if !self.process_header_line(line) {
            self.content.extend_from_slice(line);
        }
        match (length_before, self.content_length) {
            (None, Some(size)) => Some(size),
            _ => None,
        }
    }

    fn process_header_line(&mut self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        read_header(text, "Content-Type: ", &mut self.content_type)
            || read_header(text, "Content-Transfer-Encoding: ", &mut self.encoding)
            || read_header(text, "Content-Length: ", &mut self.content_length)
            || read_header(text, "ActualHash: ", &mut self.content_hash)
            || read_header(text, "DumpMalloc: ", &mut self.malloc)
            || read_header(text, "DumpJSHeap: ", &mut self.js_heap)
    }

    /// Decode the accumulated payload. Idempotent: calling this more than
    /// once leaves `decoded_content` unchanged.
    pub fn decode(&mut self) {
        if self.decoded.is_some() {
            return;
        }
        let decoded = if self.encoding.as_deref() == Some("base64") {
            let packed: Vec<u8> = self
                .content
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            match BASE64.decode(&packed) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("content block is not valid base64, keeping raw bytes: {err}");
                    self.content.clone()
                }
            }
        } else {
            self.content.clone()
        };
        self.decoded = Some(decoded);
    }

    /// Payload after `decode()`; the raw content if `decode()` was not
    /// called yet.
    pub fn decoded_content(&self) -> &[u8] {
        self.decoded.as_deref().unwrap_or(&self.content)
    }
}

/// Parse `Header: value` into `slot`, taking the first whitespace-delimited
/// token as the value. Returns false when the line is not this header, the
/// header was already set, or the value fails to parse.
fn read_header<T: std::str::FromStr>(line: &str, header: &str, slot: &mut Option<T>) -> bool {
    if slot.is_some() || !line.starts_with(header) {
        return false;
    }
    let Some(value) = line[header.len()..].split_whitespace().next() else {
        return false;
    };
    match value.parse() {
        Ok(parsed) => {
            *slot = Some(parsed);
            true
        }
        Err(_) => {
            warn!("malformed {header}header value: {value:?}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_headers() {
        let mut block = ContentBlock::new();
        assert_eq!(block.process_line(b"Content-Type: text/plain\n"), None);
        assert_eq!(block.process_line(b"ActualHash: abc123\n"), None);
        assert_eq!(block.process_line(b"DumpMalloc: 1234.5\n"), None);
        assert_eq!(block.content_type.as_deref(), Some("text/plain"));
        assert_eq!(block.content_hash.as_deref(), Some("abc123"));
        assert_eq!(block.malloc, Some(1234.5));
        assert!(block.content.is_empty());
    }

    #[test]
    fn content_length_requests_exact_read() {
        let mut block = ContentBlock::new();
        assert_eq!(block.process_line(b"Content-Length: 17\n"), Some(17));
        assert_eq!(block.content_length, Some(17));
        // A second Content-Length is no longer a header.
        assert_eq!(block.process_line(b"Content-Length: 99\n"), None);
        assert_eq!(block.content_length, Some(17));
        assert_eq!(block.content, b"Content-Length: 99\n");
    }

    #[test]
    fn repeated_header_becomes_content() {
        let mut block = ContentBlock::new();
        block.process_line(b"Content-Type: text/plain\n");
        block.process_line(b"Content-Type: image/png\n");
        assert_eq!(block.content_type.as_deref(), Some("text/plain"));
        assert_eq!(block.content, b"Content-Type: image/png\n");
    }

    #[test]
    fn unrecognized_lines_accumulate() {
        let mut block = ContentBlock::new();
        block.process_line(b"hello\n");
        block.process_line(b"world\n");
        assert_eq!(block.content, b"hello\nworld\n");
    }

    #[test]
    fn decode_without_encoding_is_identity() {
        let mut block = ContentBlock::new();
        block.process_line(b"hello\n");
        block.decode();
        assert_eq!(block.decoded_content(), b"hello\n");
    }

    #[test]
    fn decode_base64() {
        let mut block = ContentBlock::new();
        block.process_line(b"Content-Transfer-Encoding: base64\n");
        block.process_line(b"aGVsbG8=\n");
        block.decode();
        assert_eq!(block.decoded_content(), b"hello");
    }

    #[test]
    fn decode_is_idempotent() {
        let mut block = ContentBlock::new();
        block.process_line(b"Content-Transfer-Encoding: base64\n");
        block.process_line(b"aGVsbG8=\n");
        block.decode();
        let first = block.decoded_content().to_vec();
        block.decode();
        assert_eq!(block.decoded_content(), first.as_slice());
    }

    #[test]
    fn undecodable_base64_keeps_raw_bytes() {
        let mut block = ContentBlock::new();
        block.process_line(b"Content-Transfer-Encoding: base64\n");
        block.process_line(b"not base64!!\n");
        block.decode();
        assert_eq!(block.decoded_content(), b"not base64!!\n");
    }

    #[test]
    fn malformed_header_value_is_content() {
        let mut block = ContentBlock::new();
        assert_eq!(block.process_line(b"Content-Length: banana\n"), None);
        assert_eq!(block.content_length, None);
        assert_eq!(block.content, b"Content-Length: banana\n");
    }
}
