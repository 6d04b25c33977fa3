//! Gzip helpers for metadata, signal index caches and payload blocks

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CodecError, Result};

/// Highest gzip level; configured strengths above it are clamped.
const MAX_LEVEL: u32 = 9;

pub fn gzip(data: &[u8], strength: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(strength.min(MAX_LEVEL)));
    encoder
        .write_all(data)
        .map_err(|e| CodecError::compression("gzip", e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::compression("gzip", e.to_string()))
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| CodecError::compression("gzip", e.to_string()))?;
    Ok(decompressed)
}
