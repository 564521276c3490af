//! Incremental decoder for OpenAI-style `data: <json>` event streams.
//!
//! Reads may split lines anywhere, including inside a multi-byte UTF-8
//! sequence, so bytes are buffered until a full line is available.

use serde_json::Value;

use crate::models::StreamChunk;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChunk {
    Delta(String),
    Finish { reason: String, text: Option<String> },
    Done,
    /// Valid chunk without text, e.g. the opening role-only delta
    Empty,
    Malformed(String),
}

pub fn parse_payload(payload: &str) -> ParsedChunk {
    if payload == DONE_MARKER {
        return ParsedChunk::Done;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => return ParsedChunk::Malformed(format!("invalid json: {e}")),
    };
    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        // usage-only trailers have no choices
        return if value.is_object() {
            ParsedChunk::Empty
        } else {
            ParsedChunk::Malformed("chunk is not an object".to_string())
        };
    };

    let text = choice
        .get("delta")
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string);
    let finish = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    match (text, finish) {
        (text, Some(reason)) => ParsedChunk::Finish { reason, text },
        (Some(text), None) => ParsedChunk::Delta(text),
        (None, None) => ParsedChunk::Empty,
    }
}

// longest line kept while waiting for its newline
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct SseTranscoder {
    buffer: Vec<u8>,
    // prefix of `buffer` already searched for a newline
    scanned: usize,
    // inside an oversized line; bytes up to the next newline are dropped
    discarding: bool,
    max_line: usize,
    finished: bool,
    skipped: usize,
}

impl Default for SseTranscoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            max_line,
            finished: false,
            skipped: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of malformed or oversized lines dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feeds one network read and returns the chunks completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        let mut start = 0;
        while let Some(pos) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + pos;
            self.scanned = end + 1;
            if self.discarding {
                self.discarding = false;
            } else if end - start > self.max_line {
                self.skip_oversized();
            } else {
                let line = self.buffer[start..end].to_vec();
                self.process_line(&line, &mut out);
            }
            start = end + 1;
            if self.finished {
                self.buffer.clear();
                self.scanned = 0;
                return out;
            }
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            self.buffer.clear();
            self.scanned = 0;
            if !self.discarding {
                self.discarding = true;
                self.skip_oversized();
            }
        }
        out
    }

    /// Flushes a trailing unterminated line once the upstream closes.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if !self.finished && !self.discarding && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut out);
        }
        self.buffer.clear();
        self.scanned = 0;
        self.finished = true;
        out
    }

    fn process_line(&mut self, line: &[u8], out: &mut Vec<StreamChunk>) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(e) => {
                self.skip(&format!("invalid utf-8: {e}"));
                return;
            }
        };
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            // blank separators, comments, event:/id: fields
            return;
        };

        match parse_payload(payload.trim()) {
            ParsedChunk::Delta(text) => out.push(StreamChunk {
                text,
                finish_reason: None,
            }),
            ParsedChunk::Finish { reason, text } => {
                out.push(StreamChunk {
                    text: text.unwrap_or_default(),
                    finish_reason: Some(reason),
                });
                self.finished = true;
            }
            ParsedChunk::Done => self.finished = true,
            ParsedChunk::Empty => {}
            ParsedChunk::Malformed(reason) => self.skip(&reason),
        }
    }

    fn skip_oversized(&mut self) {
        self.skip(&format!("line longer than {} bytes", self.max_line));
    }

    fn skip(&mut self, reason: &str) {
        self.skipped += 1;
        tracing::warn!(reason, "skipping malformed stream chunk");
    }
}
