//! Length-prefixed frame codec for the browser's native-messaging channel.
//!
//! Each record on the wire is a little-endian `u32` length followed by that
//! many bytes of UTF-8 JSON. The cap is [`MAX_FRAME_BYTES`] per record; a
//! declared length above the cap poisons the stream position, so the decoder
//! discards its buffer and resynchronizes on whatever the peer sends next.

use serde::Serialize;
use thiserror::Error;

use crate::protocol::MAX_FRAME_BYTES;

/// Length-prefix header size in bytes.
pub const FRAME_HEADER_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum FramedCodecError {
    #[error("frame payload exceeds {max_bytes} bytes (got {frame_bytes})")]
    FrameTooLarge {
        frame_bytes: usize,
        max_bytes: usize,
    },
    #[error("invalid JSON in frame payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Serialize a record and prepend the little-endian length header.
///
/// Fails with [`FramedCodecError::FrameTooLarge`] when the serialized body
/// exceeds [`MAX_FRAME_BYTES`]; callers above the transport map that to the
/// wire code `MESSAGE_TOO_LARGE`.
pub fn encode_frame<T: Serialize>(record: &T) -> Result<Vec<u8>, FramedCodecError> {
    let body = serde_json::to_vec(record)?;
    encode_frame_bytes(&body)
}

/// Frame an already-serialized JSON body.
pub fn encode_frame_bytes(body: &[u8]) -> Result<Vec<u8>, FramedCodecError> {
    if body.len() > MAX_FRAME_BYTES {
        return Err(FramedCodecError::FrameTooLarge {
            frame_bytes: body.len(),
            max_bytes: MAX_FRAME_BYTES,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| FramedCodecError::FrameTooLarge {
        frame_bytes: body.len(),
        max_bytes: MAX_FRAME_BYTES,
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Incremental frame decoder over an arbitrary byte stream.
///
/// Feed raw reads with [`extend`](Self::extend) and drain complete payloads
/// with [`next_frame`](Self::next_frame). Partial headers and payloads split
/// across reads are carried between calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame payload, if one is buffered.
    ///
    /// A declared length above the cap discards the whole buffer (the stream
    /// position is unrecoverable) and returns an error; the decoder itself
    /// remains usable for subsequent data.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramedCodecError> {
        if self.buf.len() < FRAME_HEADER_BYTES {
            return Ok(None);
        }
        let header: [u8; FRAME_HEADER_BYTES] = self.buf[..FRAME_HEADER_BYTES]
            .try_into()
            .expect("slice length checked above");
        let declared = u32::from_le_bytes(header) as usize;
        if declared > MAX_FRAME_BYTES {
            self.buf.clear();
            return Err(FramedCodecError::FrameTooLarge {
                frame_bytes: declared,
                max_bytes: MAX_FRAME_BYTES,
            });
        }
        if self.buf.len() < FRAME_HEADER_BYTES + declared {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + declared].to_vec();
        self.buf.drain(..FRAME_HEADER_BYTES + declared);
        Ok(Some(payload))
    }

    /// Bytes currently buffered but not yet consumed as a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
