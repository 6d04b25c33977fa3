//! Transport counters
//!
//! Lock-free counters shared by every connection task. Snapshots feed the
//! publisher's lifetime statistics; `reset` clears them without interrupting traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Clone, Default)]
pub struct TransportMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    payloads_sent: AtomicU64,
    payloads_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    queue_overflows: AtomicU64,
    connections_accepted: AtomicU64,
}

/// Point-in-time copy of the transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub payloads_sent: u64,
    pub payloads_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub queue_overflows: u64,
    pub connections_accepted: u64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_send(&self, bytes: usize) {
        self.inner.payloads_sent.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_receive(&self, bytes: usize) {
        self.inner.payloads_received.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_overflow(&self) {
        self.inner.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection(&self) {
        self.inner.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner;
        MetricsSnapshot {
            payloads_sent: c.payloads_sent.load(Ordering::Relaxed),
            payloads_received: c.payloads_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            queue_overflows: c.queue_overflows.load(Ordering::Relaxed),
            connections_accepted: c.connections_accepted.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        let c = &self.inner;
        for counter in [
            &c.payloads_sent,
            &c.payloads_received,
            &c.bytes_sent,
            &c.bytes_received,
            &c.errors,
            &c.queue_overflows,
            &c.connections_accepted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
