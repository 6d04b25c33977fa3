//! Lifetime statistics exposed to collaborators

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use gateway_codec::measurement::TICKS_PER_MILLISECOND;
use serde::Serialize;

#[derive(Debug)]
pub struct LifetimeCounters {
    measurements: AtomicU64,
    bytes_sent: AtomicU64,
    latency_total: AtomicI64,
    latency_min: AtomicI64,
    latency_max: AtomicI64,
    latency_count: AtomicU64,
    buffer_block_retransmissions: AtomicU64,
    discarded_packets: AtomicU64,
}

/// Point-in-time copy of [`LifetimeCounters`]; latencies in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LifetimeSnapshot {
    pub measurements: u64,
    pub bytes_sent: u64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub average_latency_ms: f64,
    pub buffer_block_retransmissions: u64,
    /// Queued packets shed before reaching the socket
    pub discarded_packets: u64,
}

impl Default for LifetimeCounters {
    fn default() -> Self {
        Self {
            measurements: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            latency_total: AtomicI64::new(0),
            latency_min: AtomicI64::new(i64::MAX),
            latency_max: AtomicI64::new(i64::MIN),
            latency_count: AtomicU64::new(0),
            buffer_block_retransmissions: AtomicU64::new(0),
            discarded_packets: AtomicU64::new(0),
        }
    }
}

impl LifetimeCounters {
    pub fn record_measurements(&self, count: usize) {
        self.measurements.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Latency in ticks between measurement time and publication.
    pub fn record_latency(&self, ticks: i64) {
        self.latency_total.fetch_add(ticks, Ordering::Relaxed);
        self.latency_min.fetch_min(ticks, Ordering::Relaxed);
        self.latency_max.fetch_max(ticks, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        self.buffer_block_retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded_packet(&self) {
        self.discarded_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn measurements(&self) -> u64 {
        self.measurements.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LifetimeSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let to_ms = |ticks: i64| ticks as f64 / TICKS_PER_MILLISECOND as f64;
        let (min, max, average) = if count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (
                to_ms(self.latency_min.load(Ordering::Relaxed)),
                to_ms(self.latency_max.load(Ordering::Relaxed)),
                to_ms(self.latency_total.load(Ordering::Relaxed)) / count as f64,
            )
        };
        LifetimeSnapshot {
            measurements: self.measurements.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            min_latency_ms: min,
            max_latency_ms: max,
            average_latency_ms: average,
            buffer_block_retransmissions: self.buffer_block_retransmissions.load(Ordering::Relaxed),
            discarded_packets: self.discarded_packets.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.measurements.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.latency_total.store(0, Ordering::Relaxed);
        self.latency_min.store(i64::MAX, Ordering::Relaxed);
        self.latency_max.store(i64::MIN, Ordering::Relaxed);
        self.latency_count.store(0, Ordering::Relaxed);
        self.buffer_block_retransmissions.store(0, Ordering::Relaxed);
        self.discarded_packets.store(0, Ordering::Relaxed);
    }
}
