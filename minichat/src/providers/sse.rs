//! Line framing for server-sent event bodies.

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Accumulates raw body bytes and hands out complete lines.
///
/// Reads may end anywhere, including inside a multi-byte character, so bytes
/// are kept until a newline arrives and only complete lines are decoded.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator, or `None` if no newline is
    /// buffered yet.
    pub fn next_line(&mut self) -> Option<Result<String, std::string::FromUtf8Error>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8(line))
    }

    /// Whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<Result<String, std::string::FromUtf8Error>> {
        if self.buf.is_empty() {
            return None;
        }
        Some(String::from_utf8(std::mem::take(&mut self.buf)))
    }
}

/// The JSON payload of an event line, or `None` for blank lines, non-data
/// lines and the end-of-stream sentinel.
pub fn parse_data_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let data = trimmed.strip_prefix(DATA_PREFIX)?;
    if data == DONE_SENTINEL {
        return None;
    }
    Some(data)
}
