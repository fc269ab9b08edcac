//! The two on-the-wire encodings and the chunking layer above them.
//!
//! - [`framed`] — 4-byte little-endian length prefix + UTF-8 JSON, used on
//!   the browser's native-messaging stdio channel.
//! - [`line`] — newline-delimited UTF-8 JSON with a transparent gzip
//!   envelope, used on the local unix socket.
//! - [`chunk`] — splits records that exceed the framed cap into a chunk set
//!   and reassembles them on the far side.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub mod chunk;
pub mod framed;
pub mod line;

/// Gzip-compress a byte slice.
pub fn gzip_compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Gzip-decompress a byte slice.
pub fn gzip_decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
