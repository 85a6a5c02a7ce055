//! Reassembly of the backend's newline-delimited JSON stream.
//!
//! The backend streams one JSON object per line, but network chunks do not
//! respect line boundaries: an object may be split across two chunks, or
//! several objects may arrive in one. Anything after the last newline is kept
//! as a carry and prefixed onto the next chunk.

use serde_json::Value;

/// Decode one chunk, given the carry left over from the previous call.
///
/// Returns every complete, valid JSON object in order, plus the new carry.
/// The carry is raw bytes so multi-byte characters split across chunks
/// survive reassembly.
pub fn decode_chunk(chunk: &[u8], carry: Vec<u8>) -> (Vec<Value>, Vec<u8>) {
    let (events, _, carry) = decode_lines(chunk, carry);
    (events, carry)
}

/// Parse whatever is left once the backend signals end-of-stream.
///
/// Invalid leftovers are discarded without a warning.
pub fn flush(carry: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(carry).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Some(value),
        _ => {
            tracing::debug!("Discarding {} trailing bytes at end of stream", carry.len());
            None
        }
    }
}

/// One complete line of the stream.
enum Line {
    Blank,
    Event(Value),
    Dropped,
}

/// Split `carry + chunk` into lines; returns events, dropped line count and new carry.
fn decode_lines(chunk: &[u8], carry: Vec<u8>) -> (Vec<Value>, usize, Vec<u8>) {
    let mut buffer = carry;
    buffer.extend_from_slice(chunk);

    let mut events = Vec::new();
    let mut dropped = 0;
    let mut start = 0;
    while let Some(offset) = buffer[start..].iter().position(|&b| b == b'\n') {
        let end = start + offset;
        match parse_line(&buffer[start..end]) {
            Line::Event(event) => events.push(event),
            Line::Dropped => dropped += 1,
            Line::Blank => {}
        }
        start = end + 1;
    }

    let carry = buffer.split_off(start);
    (events, dropped, carry)
}

fn parse_line(line: &[u8]) -> Line {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => {
            tracing::warn!("Dropping backend line with invalid UTF-8: {}", e);
            return Line::Dropped;
        }
    };
    if text.is_empty() {
        return Line::Blank;
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Line::Event(value),
        Ok(_) => {
            tracing::warn!("Dropping backend line that is not a JSON object: {}", text);
            Line::Dropped
        }
        Err(e) => {
            tracing::warn!("Failed to parse backend line: {} ({})", text, e);
            Line::Dropped
        }
    }
}

/// Stateful wrapper around [`decode_chunk`] that owns the carry.
#[derive(Debug, Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
    dropped: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk, returning the events it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        let (events, dropped, carry) = decode_lines(chunk, std::mem::take(&mut self.carry));
        self.carry = carry;
        self.dropped += dropped;
        events
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Complete lines that were dropped as malformed so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Consume the decoder at end-of-stream.
    pub fn finish(self) -> Option<Value> {
        flush(&self.carry)
    }
}
