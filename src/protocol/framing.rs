// src/protocol/framing.rs

//! Newline framing for the bridge byte stream.
//!
//! Framing only delimits JSON envelopes; it knows nothing about the
//! human-readable lines inside `stream` payloads.

use tracing::{debug, warn};

use crate::errors::Result;

use super::messages::{Inbound, Outbound};

/// Serialize a message as a single `\n`-terminated JSON line.
pub fn encode_line(message: &Outbound) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Growable receive buffer that yields complete lines.
///
/// Each byte is scanned for `\n` exactly once, however the stream is chunked.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to contain no newline.
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and extract every complete line now available.
    ///
    /// Returned lines have the terminating `\n` (and a preceding `\r`)
    /// removed. Invalid UTF-8 is replaced rather than rejected.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut line_start = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.buf[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let mut line = &self.buf[line_start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            line_start = end + 1;
            search_from = line_start;
        }

        if line_start > 0 {
            self.buf.drain(..line_start);
        }
        self.scanned = self.buf.len();
        lines
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Take the unterminated remainder, e.g. at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        self.scanned = 0;
        Some(rest)
    }
}

/// Classification of one received line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Inbound),
    /// Not a JSON envelope (does not start with `{`).
    Noise(String),
    /// Looked like JSON but could not be decoded.
    DecodeError { line: String, error: String },
}

impl Frame {
    pub fn classify(line: &str) -> Frame {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Frame::Noise(trimmed.to_string());
        }
        match serde_json::from_str::<Inbound>(trimmed) {
            Ok(msg) => Frame::Message(msg),
            Err(e) => Frame::DecodeError {
                line: trimmed.to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// Decode a batch of lines extracted from one read.
///
/// Noise and decode failures go to the log; only messages are returned, in
/// the order they were received.
pub fn decode_batch(lines: Vec<String>) -> Vec<Inbound> {
    let mut messages = Vec::with_capacity(lines.len());
    for line in lines {
        match Frame::classify(&line) {
            Frame::Message(msg) => messages.push(msg),
            Frame::Noise(text) => {
                if !text.is_empty() {
                    debug!(line = %text, "bridge noise");
                }
            }
            Frame::DecodeError { line, error } => {
                warn!(%line, %error, "dropping undecodable bridge message");
            }
        }
    }
    messages
}
