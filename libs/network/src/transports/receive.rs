//! Receive-side state machines
//!
//! [`PayloadReceiver`] turns an arbitrary chunking of a framed byte stream into
//! whole payloads. It alternates between waiting for exactly one header and
//! waiting for exactly one payload body; a zero-length header goes straight back
//! to waiting for the next header. Consumers never observe partial or merged
//! payloads.

use bytes::{Bytes, BytesMut};
use gateway_codec::PayloadFramer;

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Header,
    Payload { length: usize },
}

/// Payload-aware reassembly over a byte stream
#[derive(Debug)]
pub struct PayloadReceiver {
    framer: PayloadFramer,
    max_payload_size: usize,
    state: ReceiveState,
    buffer: BytesMut,
}

impl PayloadReceiver {
    pub fn new(framer: PayloadFramer, max_payload_size: usize) -> Self {
        let header = framer.header_length();
        Self {
            framer,
            max_payload_size,
            state: ReceiveState::Header,
            buffer: BytesMut::with_capacity(header),
        }
    }

    /// Bytes still required to finish the current header or payload.
    pub fn bytes_needed(&self) -> usize {
        self.target() - self.buffer.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReceiveState::Header && self.buffer.is_empty()
    }

    /// Consumes `data` and returns every payload it completed, in order.
    ///
    /// A header whose marker does not match, or whose length exceeds the
    /// configured maximum, is a framing error; the stream is not resynchronized.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<Bytes>> {
        let mut completed = Vec::new();
        while !data.is_empty() {
            let take = self.bytes_needed().min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.bytes_needed() == 0 {
                if let Some(payload) = self.advance()? {
                    completed.push(payload);
                }
            }
        }
        Ok(completed)
    }

    fn target(&self) -> usize {
        match self.state {
            ReceiveState::Header => self.framer.header_length(),
            ReceiveState::Payload { length } => length,
        }
    }

    fn advance(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            ReceiveState::Header => {
                let length = self.framer.extract_length(&self.buffer).ok_or_else(|| {
                    TransportError::protocol(format!(
                        "Invalid payload header {:02X?}",
                        &self.buffer[..]
                    ))
                })? as usize;
                if length > self.max_payload_size {
                    return Err(TransportError::protocol(format!(
                        "Payload length {length} exceeds maximum {}",
                        self.max_payload_size
                    )));
                }

                self.buffer.clear();
                if length > 0 {
                    self.buffer.reserve(length);
                    self.state = ReceiveState::Payload { length };
                }
                Ok(None)
            }
            ReceiveState::Payload { .. } => {
                self.state = ReceiveState::Header;
                Ok(Some(self.buffer.split().freeze()))
            }
        }
    }
}

/// Per-client read cursor over the most recently delivered receive buffer
///
/// Lets a protocol layer pull sub-fields out of a payload at an explicit
/// offset. The cursor returns to zero once the buffer is fully consumed.
#[derive(Debug, Default)]
pub struct ReceiveCursor {
    data: Bytes,
    offset: usize,
}

impl ReceiveCursor {
    pub fn load(&mut self, data: Bytes) {
        self.data = data;
        self.offset = 0;
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Copies up to `out.len()` bytes from the cursor position and advances it.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = self.remaining().min(out.len());
        out[..count].copy_from_slice(&self.data[self.offset..self.offset + count]);
        self.offset += count;
        if self.offset >= self.data.len() {
            self.data = Bytes::new();
            self.offset = 0;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn receiver() -> PayloadReceiver {
        PayloadReceiver::new(PayloadFramer::default(), 1 << 20)
    }

    #[test]
    fn test_header_then_payload() {
        let framer = PayloadFramer::default();
        let mut rx = receiver();
        assert_eq!(rx.bytes_needed(), 8);

        let framed = framer.frame(b"hello");
        assert!(rx.feed(&framed[..8]).unwrap().is_empty());
        assert_eq!(rx.bytes_needed(), 5);
        let out = rx.feed(&framed[8..]).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"hello")]);
        assert!(rx.is_idle());
    }

    #[test]
    fn test_zero_length_payload_restarts_header_wait() {
        let framer = PayloadFramer::default();
        let mut stream = framer.frame(&[]).to_vec();
        stream.extend_from_slice(&framer.frame(b"x"));
        let out = receiver().feed(&stream).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"x")]);
    }

    #[test]
    fn test_bad_marker_is_error() {
        let mut rx = receiver();
        assert!(rx.feed(&[0xAA, 0xBB, 0xCC, 0x00, 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_oversized_payload_is_error() {
        let framed = PayloadFramer::default().frame(&[0u8; 64]);
        let mut rx = PayloadReceiver::new(PayloadFramer::default(), 32);
        assert!(matches!(rx.feed(&framed), Err(TransportError::Protocol { .. })));
    }

    #[test]
    fn test_cursor_resets_after_full_read() {
        let mut cursor = ReceiveCursor::default();
        cursor.load(Bytes::from_static(b"abcdef"));
        let mut out = [0u8; 4];
        assert_eq!(cursor.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(cursor.offset(), 4);
        assert_eq!(cursor.read(&mut out), 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(cursor.offset(), 0);
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(cursor.read(&mut out), 0);
    }

    proptest! {
        #[test]
        fn prop_chunking_never_splits_or_merges(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..20),
            chunk in 1usize..64,
        ) {
            let framer = PayloadFramer::default();
            let stream: Vec<u8> = payloads.iter().flat_map(|p| framer.frame(p).to_vec()).collect();

            let mut rx = receiver();
            let mut received = Vec::new();
            for piece in stream.chunks(chunk) {
                received.extend(rx.feed(piece).unwrap());
            }

            let expected: Vec<Bytes> = payloads
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| Bytes::copy_from_slice(p))
                .collect();
            prop_assert_eq!(received, expected);
            prop_assert!(rx.is_idle());
        }
    }
}
