//! Reliable buffer block delivery
//!
//! Each block gets a sequence number and stays pending until the client
//! confirms it. Pending blocks older than the retransmission timeout are handed
//! back for resending.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

#[derive(Debug)]
struct PendingBlock {
    payload: Bytes,
    sent_at: Instant,
}

#[derive(Debug, Default)]
pub struct BufferBlockTracker {
    next_sequence: AtomicU32,
    pending: Mutex<BTreeMap<u32, PendingBlock>>,
}

impl BufferBlockTracker {
    /// Builds `[sequence:u32][runtime index:u16][data]` and tracks it as sent now.
    pub fn track(&self, runtime_index: u16, data: &[u8]) -> (u32, Bytes) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut buf = BytesMut::with_capacity(6 + data.len());
        buf.put_u32(sequence);
        buf.put_u16(runtime_index);
        buf.put_slice(data);
        let payload = buf.freeze();

        self.pending.lock().insert(
            sequence,
            PendingBlock {
                payload: payload.clone(),
                sent_at: Instant::now(),
            },
        );
        (sequence, payload)
    }

    pub fn confirm(&self, sequence: u32) -> bool {
        self.pending.lock().remove(&sequence).is_some()
    }

    /// Blocks unconfirmed for longer than `timeout`, restamped as sent at `now`.
    pub fn expired(&self, timeout: Duration, now: Instant) -> Vec<(u32, Bytes)> {
        self.pending
            .lock()
            .iter_mut()
            .filter(|(_, block)| now.saturating_duration_since(block.sent_at) >= timeout)
            .map(|(sequence, block)| {
                block.sent_at = now;
                (*sequence, block.payload.clone())
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_confirm_expire() {
        let tracker = BufferBlockTracker::default();
        let (first, payload) = tracker.track(7, b"abc");
        let (second, _) = tracker.track(7, b"def");
        assert_eq!((first, second), (0, 1));
        assert_eq!(&payload[..], &[0, 0, 0, 0, 0, 7, b'a', b'b', b'c']);

        assert!(tracker.confirm(first));
        assert!(!tracker.confirm(first));
        assert_eq!(tracker.pending(), 1);

        let timeout = Duration::from_secs(5);
        assert!(tracker.expired(timeout, Instant::now()).is_empty());
        let later = Instant::now() + timeout;
        let expired = tracker.expired(timeout, later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, second);
        assert!(tracker.expired(timeout, later).is_empty(), "resent blocks are restamped");
    }
}
