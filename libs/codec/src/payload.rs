//! Payload-aware framing
//!
//! A framed payload on the wire is `marker || u32 little-endian length || payload`.
//! The functions here are pure: no I/O, no allocation beyond the framed buffer.
//! A decoded length of zero is a valid, empty payload; "no length yet" is `None`.

use bytes::{BufMut, Bytes, BytesMut};

/// Default payload marker
pub const DEFAULT_MARKER: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

/// Size of the little-endian length field following the marker
pub const LENGTH_SEGMENT: usize = 4;

/// Total header size for `marker`.
pub fn header_length(marker: &[u8]) -> usize {
    marker.len() + LENGTH_SEGMENT
}

/// Prepends `marker || len(payload)` to `payload`.
pub fn add_header(payload: &[u8], marker: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(header_length(marker) + payload.len());
    framed.extend_from_slice(marker);
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Returns true when `buffer` starts with `marker`.
///
/// Never reads past the end of `buffer`; a buffer shorter than the marker has no header.
pub fn has_header(buffer: &[u8], marker: &[u8]) -> bool {
    buffer.len() >= marker.len() && buffer[..marker.len()] == *marker
}

/// Decodes the payload length from the first `valid_length` bytes of `buffer`.
///
/// Returns `None` while fewer than `marker.len() + 4` bytes are available or when
/// the marker does not match.
pub fn extract_length(buffer: &[u8], valid_length: usize, marker: &[u8]) -> Option<u32> {
    let valid = valid_length.min(buffer.len());
    if valid < header_length(marker) || !has_header(buffer, marker) {
        return None;
    }

    let start = marker.len();
    let mut length = [0u8; LENGTH_SEGMENT];
    length.copy_from_slice(&buffer[start..start + LENGTH_SEGMENT]);
    Some(u32::from_le_bytes(length))
}

/// Same as [`extract_length`] but reports "not available" as `-1`.
pub fn extract_length_or_sentinel(buffer: &[u8], valid_length: usize, marker: &[u8]) -> i64 {
    extract_length(buffer, valid_length, marker)
        .map(i64::from)
        .unwrap_or(-1)
}

/// Marker-bound framer shared by the transport send and receive paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFramer {
    marker: Bytes,
}

impl Default for PayloadFramer {
    fn default() -> Self {
        Self::new(&DEFAULT_MARKER)
    }
}

impl PayloadFramer {
    pub fn new(marker: &[u8]) -> Self {
        Self {
            marker: Bytes::copy_from_slice(marker),
        }
    }

    pub fn marker(&self) -> &[u8] {
        &self.marker
    }

    pub fn header_length(&self) -> usize {
        header_length(&self.marker)
    }

    /// Frames `payload` into a single contiguous buffer.
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let mut framed = BytesMut::with_capacity(self.header_length() + payload.len());
        framed.put_slice(&self.marker);
        framed.put_u32_le(payload.len() as u32);
        framed.put_slice(payload);
        framed.freeze()
    }

    pub fn extract_length(&self, buffer: &[u8]) -> Option<u32> {
        extract_length(buffer, buffer.len(), &self.marker)
    }
}
