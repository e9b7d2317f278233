use bytes::{Buf, BytesMut};

/// Longest partial line kept between reads. SBS lines are ~120 bytes, so
/// anything this long without a newline is garbage on the wire.
pub const MAX_PARTIAL_LINE_BYTES: usize = 8 * 1024;

/// Splits raw TCP chunks into complete lines.
///
/// A chunk may end mid-line; the tail is held back and glued to the front of
/// the next chunk, so a message split across reads comes out exactly once.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
    discarded_bytes: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes (without the
    /// terminator, `\r\n` or `\n`). Empty lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw = self.buffer.split_to(newline + 1);
            let mut raw = &raw[..newline];
            if let Some(stripped) = raw.strip_suffix(b"\r") {
                raw = stripped;
            }
            if raw.is_empty() {
                continue;
            }
            lines.push(String::from_utf8_lossy(raw).into_owned());
        }

        if self.buffer.len() > MAX_PARTIAL_LINE_BYTES {
            self.discarded_bytes += self.buffer.len() as u64;
            metrics::counter!("sbs.framing.oversized_discarded_total").increment(1);
            self.buffer.advance(self.buffer.len());
        }

        lines
    }

    /// Bytes waiting for their line terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes thrown away because a line never terminated
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Drop any partial line, e.g. after the connection that sent it died
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
