//! Newline-delimited record codec for the local unix socket.
//!
//! Lines are UTF-8 JSON terminated by `\n`; empty lines are skipped. A
//! decoded record of shape `{"type":"compressed","data":<base64 gzip>}` is
//! an envelope: the inner record is unwrapped before dispatch. Writers wrap
//! outbound records above [`CHUNK_THRESHOLD_BYTES`] only when the gzip
//! output is strictly smaller than the original serialization.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use memchr::memchr;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::{gzip_compress, gzip_decompress};
use crate::protocol::CHUNK_THRESHOLD_BYTES;

#[derive(Debug, Error)]
pub enum LineCodecError {
    #[error("invalid JSON record line: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("compressed envelope carries invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("compressed envelope failed to gunzip: {0}")]
    Gunzip(#[from] std::io::Error),
}

/// Incremental line splitter with a carry buffer for the trailing
/// incomplete line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw read and drain every complete, non-empty line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.carry.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(rel) = memchr(b'\n', &self.carry[start..]) {
            let end = start + rel;
            if end > start {
                lines.push(self.carry[start..end].to_vec());
            }
            start = end + 1;
        }
        self.carry.drain(..start);
        lines
    }

    /// Bytes of the trailing incomplete line carried to the next push.
    #[must_use]
    pub fn carried(&self) -> usize {
        self.carry.len()
    }
}

/// Parse one line into a JSON value, transparently unwrapping a single
/// `compressed` envelope. Nested envelopes are not unwrapped.
pub fn decode_record_line(line: &[u8]) -> Result<Value, LineCodecError> {
    let value: Value = serde_json::from_slice(line)?;
    unwrap_envelope(value)
}

fn unwrap_envelope(value: Value) -> Result<Value, LineCodecError> {
    let is_envelope = value.get("type").and_then(Value::as_str) == Some("compressed");
    if !is_envelope {
        return Ok(value);
    }
    let Some(data) = value.get("data").and_then(Value::as_str) else {
        // Malformed envelope without a data string; hand it up as-is so the
        // dispatch layer can discard it with a log line.
        return Ok(value);
    };
    let compressed = BASE64.decode(data)?;
    let inflated = gzip_decompress(&compressed)?;
    Ok(serde_json::from_slice(&inflated)?)
}

/// Serialize a record into a newline-terminated line, without compression.
pub fn encode_record_line<T: Serialize>(record: &T) -> Result<Vec<u8>, LineCodecError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Serialize a record for the socket, gzip-wrapping it when that pays off.
///
/// Bodies at or below [`CHUNK_THRESHOLD_BYTES`] are sent verbatim. Above it,
/// the body is gzipped and wrapped in a `compressed` envelope only when the
/// gzip output is strictly smaller than the original; otherwise the original
/// is sent verbatim.
pub fn encode_outbound_line<T: Serialize>(record: &T) -> Result<Vec<u8>, LineCodecError> {
    let body = serde_json::to_vec(record)?;
    if body.len() <= CHUNK_THRESHOLD_BYTES {
        let mut line = body;
        line.push(b'\n');
        return Ok(line);
    }
    let gz = gzip_compress(&body)?;
    if gz.len() >= body.len() {
        let mut line = body;
        line.push(b'\n');
        return Ok(line);
    }
    let envelope = serde_json::json!({
        "type": "compressed",
        "data": BASE64.encode(&gz),
    });
    let mut line = serde_json::to_vec(&envelope)?;
    line.push(b'\n');
    Ok(line)
}
