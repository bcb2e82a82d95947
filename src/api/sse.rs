//! Incremental SSE decoding for run streams.
//!
//! Bytes arrive in arbitrary chunks; the decoder buffers partial lines and
//! emits one payload per complete event. Multiple `data:` lines within an
//! event are joined with `\n`. Comment lines and non-`data` fields are
//! ignored, as is the `[DONE]` sentinel some servers append.

use crate::error::ApiError;
use crate::runtime::schema::StreamFrame;
use std::collections::VecDeque;

/// Stateful byte-to-payload SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    ready: VecDeque<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes from the response body.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            self.accept_line(&line);
        }
    }

    /// Flush a trailing event not followed by a blank line (end of body).
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.accept_line(&line);
        }
        self.flush_event();
    }

    /// Next complete payload, if any.
    pub fn next_payload(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn accept_line(&mut self, raw_line: &str) {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() {
            self.flush_event();
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = if let Some((field, value)) = line.split_once(':') {
            (field, value.strip_prefix(' ').unwrap_or(value))
        } else {
            (line, "")
        };
        if field == "data" {
            self.data_lines.push(value.to_string());
        }
    }

    fn flush_event(&mut self) {
        if self.data_lines.is_empty() {
            return;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        if payload.trim().is_empty() || payload.trim() == "[DONE]" {
            return;
        }
        self.ready.push_back(payload);
    }
}

/// Parse one SSE payload as a run frame envelope.
pub fn parse_frame(payload: &str) -> Result<StreamFrame, ApiError> {
    serde_json::from_str(payload)
        .map_err(|err| ApiError::InvalidResponse(format!("invalid stream frame: {err}")))
}
