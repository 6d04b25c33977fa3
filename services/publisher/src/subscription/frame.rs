//! Time-aligned frame assembly for synchronized subscriptions
//!
//! Measurements sharing a timestamp can arrive in separate batches. A frame
//! stays open until a newer timestamp supersedes it or it has waited out the
//! lag window, so one timestamp yields one frame.

use std::collections::BTreeMap;
use std::time::Duration;

use gateway_codec::Measurement;
use tokio::time::Instant;

struct OpenFrame {
    opened: Instant,
    measurements: Vec<Measurement>,
}

#[derive(Default)]
pub struct FrameBuffer {
    frames: BTreeMap<i64, OpenFrame>,
}

impl FrameBuffer {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Adds a batch and returns the frames superseded by its newest timestamp.
    pub fn push(&mut self, batch: Vec<Measurement>, now: Instant) -> Vec<Measurement> {
        for measurement in batch {
            self.frames
                .entry(measurement.timestamp)
                .or_insert_with(|| OpenFrame {
                    opened: now,
                    measurements: Vec::new(),
                })
                .measurements
                .push(measurement);
        }

        let Some(newest) = self.frames.keys().next_back().copied() else {
            return Vec::new();
        };
        let open = self.frames.split_off(&newest);
        let superseded = std::mem::replace(&mut self.frames, open);
        flatten(superseded)
    }

    /// Releases frames that have been open for at least `lag`.
    pub fn expire(&mut self, now: Instant, lag: Duration) -> Vec<Measurement> {
        let expired: Vec<i64> = self
            .frames
            .iter()
            .filter(|(_, frame)| now.saturating_duration_since(frame.opened) >= lag)
            .map(|(timestamp, _)| *timestamp)
            .collect();
        let released = expired
            .into_iter()
            .filter_map(|timestamp| self.frames.remove_entry(&timestamp))
            .collect();
        flatten(released)
    }

    /// When the oldest open frame reaches the end of its lag window
    pub fn deadline(&self, lag: Duration) -> Option<Instant> {
        self.frames.values().map(|frame| frame.opened + lag).min()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

fn flatten(frames: BTreeMap<i64, OpenFrame>) -> Vec<Measurement> {
    frames
        .into_values()
        .flat_map(|frame| frame.measurements)
        .collect()
}
