// Incremental frame parser for record-oriented byte streams
//
// The wrapped tool emits one JSON record per line, optionally prefixed with
// "data:" (event-stream framing). Chunks arrive at arbitrary boundaries, so
// the parser keeps an internal buffer and only emits records once a complete
// structural parse succeeds. Malformed prefixes are dropped up to the next
// newline and counted; nothing here ever fails the caller.

use serde_json::Value;

/// Default cap on the unparsed tail. On overflow the oldest half is dropped
/// so a child that never emits a newline can't grow the buffer unbounded.
pub const DEFAULT_MAX_BUFFER: usize = 65_536;

#[derive(Debug)]
pub struct FrameParser {
    buffer: String,
    max_buffer: usize,
    parse_errors: u64,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        FrameParser {
            buffer: String::new(),
            max_buffer,
            parse_errors: 0,
        }
    }

    /// Consume a chunk, returning zero or more completed records in arrival
    /// order. Invalid UTF-8 is decoded with replacement.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut records = Vec::new();

        // Extract newline-terminated prefixes first
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            match Self::try_parse(line.trim()) {
                LineResult::Record(value) => records.push(value),
                LineResult::Blank => {}
                LineResult::Garbage => self.parse_errors += 1,
            }
        }

        // No newline left: a complete record may still be sitting in the
        // buffer (final line of a stream that doesn't end with '\n')
        let tail = self.buffer.trim();
        if !tail.is_empty() {
            if let LineResult::Record(value) = Self::try_parse(tail) {
                records.push(value);
                self.buffer.clear();
            } else if self.buffer.len() > self.max_buffer {
                let keep = self.buffer.len() / 2;
                self.buffer = self.buffer.split_off(keep);
                self.parse_errors += 1;
            }
        } else {
            self.buffer.clear();
        }

        records
    }

    /// Discard pending buffer state.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Size of the unparsed tail, for diagnostics.
    pub fn pending_size(&self) -> usize {
        self.buffer.len()
    }

    /// Count of malformed prefixes dropped so far.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    fn try_parse(line: &str) -> LineResult {
        if line.is_empty() {
            return LineResult::Blank;
        }

        // Event-stream framing: strip the "data:" prefix before the
        // structural parse. "[DONE]" is a stream sentinel, not garbage.
        let body = match line.strip_prefix("data:") {
            Some(rest) => rest.trim_start(),
            None => line,
        };
        if body.is_empty() || body == "[DONE]" {
            return LineResult::Blank;
        }

        match serde_json::from_str::<Value>(body) {
            Ok(value) => LineResult::Record(value),
            Err(_) => LineResult::Garbage,
        }
    }
}

enum LineResult {
    Record(Value),
    Blank,
    Garbage,
}
