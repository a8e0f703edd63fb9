//! SSE frame decoder
//!
//! The upstream streams `event: <type>` / `data: <chunk>` frames where every
//! `data:` payload is URL-safe base64 of a length-delimited protobuf
//! `ResponseEvent`. One logical event may span several `data:` lines; a
//! blank line closes it. Comment lines (`:`) are skipped and `data: [DONE]`
//! terminates the stream.
//!
//! The decoder is push-based: feed it raw byte chunks as they arrive (the
//! caller reads small chunks to keep latency down) and collect completed
//! events. Malformed frames are logged and skipped — a bad frame never
//! aborts the stream.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use prost::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proto::ResponseEvent;

/// Incremental SSE parser yielding decoded response events.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: String,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes; returns every event completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ResponseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = match std::str::from_utf8(&line_bytes) {
                Ok(s) => s.trim(),
                Err(_) => {
                    warn!("skipping undecodable SSE line");
                    continue;
                }
            };

            if line.is_empty() {
                // Event boundary: decode the accumulated payload.
                if !self.data.is_empty() {
                    match decode_payload(&self.data) {
                        Ok(event) => events.push(event),
                        Err(e) => warn!(error = %e, "failed to parse SSE event"),
                    }
                    self.data.clear();
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(event_type) = line.strip_prefix("event:") {
                debug!(event_type = event_type.trim(), "sse event");
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    debug!("stream finished: [DONE]");
                    self.done = true;
                    return events;
                }
                // Continuation lines concatenate into one payload.
                self.data.push_str(data);
            }
        }

        events
    }

    /// Consume a leftover partial event at stream end, if any.
    pub fn finish(&mut self) -> Option<ResponseEvent> {
        if self.done || self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data);
        match decode_payload(&data) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "failed to parse trailing SSE event");
                None
            }
        }
    }
}

/// Pad to a multiple of four, URL-safe base64 decode, then protobuf decode.
/// Payloads are length-delimited; a plain encoding is accepted as fallback.
pub fn decode_payload(data: &str) -> Result<ResponseEvent> {
    let mut padded = data.to_string();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.push_str(&"=".repeat(4 - rem));
    }

    let bytes = URL_SAFE
        .decode(padded.as_bytes())
        .map_err(|e| Error::Base64(e.to_string()))?;

    ResponseEvent::decode_length_delimited(bytes.as_slice())
        .or_else(|_| ResponseEvent::decode(bytes.as_slice()))
        .map_err(|e| Error::Decode(e.to_string()))
}
