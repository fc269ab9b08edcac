//! Chunk split and reassembly for records that exceed the framed cap.
//!
//! A chunk set shares a `request_id`; indices run `0..total_chunks`. The
//! payload is gzipped when that shrinks it, split into bounded byte ranges,
//! and each range travels base64-encoded in its own `chunk` record. The
//! receiver concatenates by ascending index, gunzips when `compressed`, and
//! parses the concatenation as JSON. A set that is still incomplete after
//! [`REASSEMBLY_TIMEOUT`] is discarded.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use super::{gzip_compress, gzip_decompress};
use crate::protocol::{ChunkRecord, CHUNK_THRESHOLD_BYTES};

/// Incomplete chunk sets older than this are freed.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum raw payload bytes carried per chunk, sized so the base64 `data`
/// field stays within [`CHUNK_THRESHOLD_BYTES`] and the whole chunk record
/// fits one frame with room to spare.
pub const CHUNK_RAW_BYTES: usize = CHUNK_THRESHOLD_BYTES / 4 * 3;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk set {request_id} declares zero chunks")]
    EmptySet { request_id: String },
    #[error("chunk index {index} out of range for set {request_id} of {total} chunks")]
    IndexOutOfRange {
        request_id: String,
        index: u32,
        total: u32,
    },
    #[error("chunk for set {request_id} disagrees on set metadata")]
    InconsistentSet { request_id: String },
    #[error("chunk set {request_id} timed out before completion")]
    TimedOut { request_id: String },
    #[error("reassembled set {request_id} is {actual} bytes, declared {declared}")]
    SizeMismatch {
        request_id: String,
        declared: u64,
        actual: u64,
    },
    #[error("chunk data for set {request_id} is not valid base64: {source}")]
    InvalidBase64 {
        request_id: String,
        source: base64::DecodeError,
    },
    #[error("chunk set {1} failed to gunzip: {0}")]
    Gunzip(std::io::Error, String),
}

/// Split a serialized record into a chunk set.
///
/// The payload is gzipped first; `compressed` is set only when gzip actually
/// shrank it, mirroring the line-transport rule.
pub fn split_into_chunks(
    request_id: &str,
    agent_id: &str,
    payload: &[u8],
) -> std::io::Result<Vec<ChunkRecord>> {
    let gz = gzip_compress(payload)?;
    let (body, compressed) = if gz.len() < payload.len() {
        (gz, true)
    } else {
        (payload.to_vec(), false)
    };

    let total_size = body.len() as u64;
    let total_chunks = body.len().div_ceil(CHUNK_RAW_BYTES).max(1) as u32;
    let chunks = body
        .chunks(CHUNK_RAW_BYTES)
        .enumerate()
        .map(|(index, slice)| ChunkRecord {
            request_id: request_id.to_string(),
            agent_id: agent_id.to_string(),
            chunk_index: index as u32,
            total_chunks,
            total_size,
            compressed,
            data: BASE64.encode(slice),
        })
        .collect::<Vec<_>>();

    if chunks.is_empty() {
        // Zero-byte payload still travels as a single empty chunk.
        return Ok(vec![ChunkRecord {
            request_id: request_id.to_string(),
            agent_id: agent_id.to_string(),
            chunk_index: 0,
            total_chunks: 1,
            total_size: 0,
            compressed,
            data: String::new(),
        }]);
    }
    Ok(chunks)
}

#[derive(Debug)]
struct PartialSet {
    total_chunks: u32,
    total_size: u64,
    compressed: bool,
    parts: BTreeMap<u32, Vec<u8>>,
    started_at: Instant,
}

/// Per-`request_id` accumulator with a reassembly deadline.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    sets: HashMap<String, PartialSet>,
}

impl ChunkAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one chunk; returns the reassembled payload once the set is
    /// complete. Errors free the partial set.
    pub fn insert(
        &mut self,
        chunk: ChunkRecord,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, ChunkError> {
        let request_id = chunk.request_id.clone();
        if chunk.total_chunks == 0 {
            self.sets.remove(&request_id);
            return Err(ChunkError::EmptySet { request_id });
        }
        if chunk.chunk_index >= chunk.total_chunks {
            self.sets.remove(&request_id);
            return Err(ChunkError::IndexOutOfRange {
                request_id,
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }

        let data = BASE64
            .decode(chunk.data.as_bytes())
            .map_err(|source| {
                self.sets.remove(&request_id);
                ChunkError::InvalidBase64 {
                    request_id: request_id.clone(),
                    source,
                }
            })?;

        let set = self.sets.entry(request_id.clone()).or_insert_with(|| PartialSet {
            total_chunks: chunk.total_chunks,
            total_size: chunk.total_size,
            compressed: chunk.compressed,
            parts: BTreeMap::new(),
            started_at: now,
        });

        if now.duration_since(set.started_at) > REASSEMBLY_TIMEOUT {
            self.sets.remove(&request_id);
            return Err(ChunkError::TimedOut { request_id });
        }
        if set.total_chunks != chunk.total_chunks
            || set.total_size != chunk.total_size
            || set.compressed != chunk.compressed
        {
            self.sets.remove(&request_id);
            return Err(ChunkError::InconsistentSet { request_id });
        }

        set.parts.insert(chunk.chunk_index, data);
        if set.parts.len() < set.total_chunks as usize {
            return Ok(None);
        }

        let set = self
            .sets
            .remove(&request_id)
            .expect("complete set present by construction");
        let mut body = Vec::with_capacity(set.total_size as usize);
        for part in set.parts.into_values() {
            body.extend_from_slice(&part);
        }
        if body.len() as u64 != set.total_size {
            return Err(ChunkError::SizeMismatch {
                request_id,
                declared: set.total_size,
                actual: body.len() as u64,
            });
        }
        if set.compressed {
            body = gzip_decompress(&body)
                .map_err(|err| ChunkError::Gunzip(err, request_id.clone()))?;
        }
        Ok(Some(body))
    }

    /// Free every set whose deadline has passed; returns the expired ids so
    /// the caller can log the failure.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .sets
            .iter()
            .filter(|(_, set)| now.duration_since(set.started_at) > REASSEMBLY_TIMEOUT)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.sets.remove(id);
        }
        expired
    }

    /// Number of incomplete sets currently held.
    #[must_use]
    pub fn partial_sets(&self) -> usize {
        self.sets.len()
    }
}
