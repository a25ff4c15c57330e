//! Blank-line framing over an append-only byte buffer.
//!
//! The remainder is kept as raw bytes so that a chunk boundary falling inside a
//! multi-byte UTF-8 sequence never corrupts the text of the frame.

use bytes::{Buf, BytesMut};

/// One complete, separator-terminated unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub text: String,
}

impl Frame {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Non-blank lines of the frame, with any trailing `\r` removed.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .filter(|l| !l.trim().is_empty())
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Bytes before this offset are known not to contain a separator start.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, sep_len)) = find_separator(&self.buf, self.scanned) {
            let raw = self.buf.split_to(end);
            self.buf.advance(sep_len);
            self.scanned = 0;
            if let Some(frame) = to_frame(&raw[..]) {
                frames.push(frame);
            }
        }
        // A separator may straddle the next chunk boundary; rescan the last few bytes.
        self.scanned = self.buf.len().saturating_sub(3);
        frames
    }

    /// Flush whatever is left as a last frame. Used when the transport ends
    /// without a trailing blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        let raw = self.buf.split();
        self.scanned = 0;
        to_frame(&raw[..])
    }

    /// Drop any partial frame, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Bytes currently held back waiting for a separator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Locate the first blank-line separator at or after `from`.
/// Returns the frame end offset and the separator length.
fn find_separator(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match &buf[i + 1..] {
                [b'\n', ..] => return Some((i, 2)),
                [b'\r', b'\n', ..] => return Some((i, 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn to_frame(raw: &[u8]) -> Option<Frame> {
    let decoded = String::from_utf8_lossy(raw);
    let text = decoded.strip_suffix('\r').unwrap_or(&decoded[..]);
    if text.trim().is_empty() {
        return None;
    }
    Some(Frame::new(text))
}
