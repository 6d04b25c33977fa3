//! Per-client measurement subscriptions
//!
//! A [`Subscription`] owns one task that turns routed measurement batches into
//! data packets for its client. Unsynchronized subscriptions publish batches as
//! they arrive (or per processing interval), synchronized subscriptions emit one
//! packet per distinct timestamp carrying a frame-level time, holding each frame
//! open for its lag window so late batches for the same timestamp still join it.
//!
//! The synchronization mode is fixed for the life of a subscription; switching
//! modes replaces the object. Everything else reconfigures in place.

pub mod buffer_block;
mod frame;
pub mod routing;

pub use buffer_block::BufferBlockTracker;
pub use routing::RoutingTable;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gateway_codec::measurement::TICKS_PER_MILLISECOND;
use gateway_codec::{
    BaseTimeOffsets, DataPacketWriter, Measurement, ServerCommand, ServerResponse, SignalIndexCache,
    SignalReference,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::counters::LifetimeCounters;
use crate::error::Result;
use frame::FrameBuffer;

const TICKS_PER_SECOND: i64 = TICKS_PER_MILLISECOND * 1000;
/// Ticks between 0001-01-01 and 1970-01-01
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const MAX_MEASUREMENTS_PER_PACKET: usize = 1024;
pub const DEFAULT_LAG_TIME: Duration = Duration::from_millis(100);

/// Current UTC time in ticks
pub fn now_ticks() -> i64 {
    let now = Utc::now();
    UNIX_EPOCH_TICKS
        + now.timestamp() * TICKS_PER_SECOND
        + i64::from(now.timestamp_subsec_nanos()) / 100
}

/// Destination of a subscription's responses
pub trait PacketSink: Send + Sync {
    fn send_response(&self, response: ServerResponse, command: ServerCommand, payload: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Synchronized,
    Unsynchronized,
}

impl SubscriptionMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Synchronized => "synchronized",
            Self::Unsynchronized => "unsynchronized",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSettings {
    pub compact: bool,
    /// Gzip strength; `None` leaves packets uncompressed
    pub compression_strength: Option<u32>,
    /// Milliseconds between flushes; zero or negative publishes immediately
    pub processing_interval: i32,
    pub use_base_time_offsets: bool,
    /// How long a synchronized frame waits for more measurements
    pub lag_time: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            compact: true,
            compression_strength: None,
            processing_interval: -1,
            use_base_time_offsets: false,
            lag_time: DEFAULT_LAG_TIME,
        }
    }
}

enum SubscriptionInput {
    Measurements(Vec<Measurement>),
    ProcessingInterval,
}

struct SubscriptionState {
    settings: SubscriptionSettings,
    requested: Vec<SignalReference>,
    signal_cache: Arc<SignalIndexCache>,
    base_times: Option<BaseTimeOffsets>,
    data_start_sent: bool,
}

pub struct Subscription {
    client_id: Uuid,
    mode: SubscriptionMode,
    sink: Arc<dyn PacketSink>,
    state: RwLock<SubscriptionState>,
    inbox: mpsc::UnboundedSender<SubscriptionInput>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionInput>>>,
    cancel: CancellationToken,
    running: AtomicBool,
    buffer_blocks: BufferBlockTracker,
    counters: Arc<LifetimeCounters>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("client_id", &self.client_id)
            .field("mode", &self.mode)
            .field("running", &self.is_running())
            .field("signals", &self.state.read().signal_cache.len())
            .finish()
    }
}

impl Subscription {
    pub fn new(
        client_id: Uuid,
        mode: SubscriptionMode,
        settings: SubscriptionSettings,
        sink: Arc<dyn PacketSink>,
        counters: Arc<LifetimeCounters>,
    ) -> Arc<Self> {
        let (inbox, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            client_id,
            mode,
            sink,
            state: RwLock::new(SubscriptionState {
                settings,
                requested: Vec::new(),
                signal_cache: Arc::new(SignalIndexCache::new(client_id)),
                base_times: None,
                data_start_sent: false,
            }),
            inbox,
            receiver: Mutex::new(Some(receiver)),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            buffer_blocks: BufferBlockTracker::default(),
            counters,
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> SubscriptionSettings {
        self.state.read().settings.clone()
    }

    /// Applies new settings; an interval change takes effect on the running task.
    pub fn reconfigure(&self, settings: SubscriptionSettings) {
        let interval_changed = {
            let mut state = self.state.write();
            let changed = state.settings.processing_interval != settings.processing_interval;
            if state.settings.use_base_time_offsets != settings.use_base_time_offsets {
                state.base_times = None;
            }
            state.settings = settings;
            changed
        };
        if interval_changed {
            let _ = self.inbox.send(SubscriptionInput::ProcessingInterval);
        }
    }

    pub fn set_processing_interval(&self, interval: i32) {
        let mut settings = self.settings();
        settings.processing_interval = interval;
        self.reconfigure(settings);
    }

    pub fn signal_cache(&self) -> Arc<SignalIndexCache> {
        self.state.read().signal_cache.clone()
    }

    pub fn signal_ids(&self) -> Vec<Uuid> {
        self.state.read().signal_cache.signal_ids().collect()
    }

    /// Resolved signals the client asked for, before rights filtering
    pub fn requested_signals(&self) -> Vec<SignalReference> {
        self.state.read().requested.clone()
    }

    /// Installs a new authorized set; returns whether the subscribed signals changed.
    pub fn set_signals(&self, requested: Vec<SignalReference>, cache: SignalIndexCache) -> bool {
        let mut state = self.state.write();
        let changed = !state.signal_cache.signal_ids().eq(cache.signal_ids());
        state.requested = requested;
        state.signal_cache = Arc::new(cache);
        changed
    }

    /// Spawns the publication task. Only the first call starts anything.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(receiver) = self.receiver.lock().take() else {
            return false;
        };
        if self.cancel.is_cancelled() {
            return false;
        }
        self.running.store(true, Ordering::Release);
        tokio::spawn(Arc::clone(self).run(receiver));
        debug!(client = %self.client_id, mode = self.mode.name(), "Subscription started");
        true
    }

    /// Stops the publication task; returns false when it was not running.
    pub fn stop(&self) -> bool {
        self.cancel.cancel();
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if was_running {
            debug!(client = %self.client_id, mode = self.mode.name(), "Subscription stopped");
        }
        was_running
    }

    /// Hands a routed batch to the publication task.
    pub fn queue(&self, measurements: Vec<Measurement>) -> bool {
        self.is_running()
            && self
                .inbox
                .send(SubscriptionInput::Measurements(measurements))
                .is_ok()
    }

    /// Sends a buffer block for `signal_id`; `Ok(None)` when the signal is not subscribed.
    pub fn publish_buffer_block(&self, signal_id: &Uuid, data: &[u8]) -> Result<Option<u32>> {
        let Some(runtime_index) = self.state.read().signal_cache.index_of(signal_id) else {
            return Ok(None);
        };
        let (sequence, payload) = self.buffer_blocks.track(runtime_index, data);
        self.sink
            .send_response(ServerResponse::BufferBlock, ServerCommand::Subscribe, &payload)?;
        Ok(Some(sequence))
    }

    pub fn confirm_buffer_block(&self, sequence: u32) -> bool {
        self.buffer_blocks.confirm(sequence)
    }

    pub fn pending_buffer_blocks(&self) -> usize {
        self.buffer_blocks.pending()
    }

    /// Resends blocks left unconfirmed for `timeout`; returns how many went out.
    pub fn retransmit_expired(&self, timeout: Duration) -> usize {
        let expired = self.buffer_blocks.expired(timeout, Instant::now());
        for (sequence, payload) in &expired {
            debug!(client = %self.client_id, sequence, "Retransmitting buffer block");
            if let Err(e) = self
                .sink
                .send_response(ServerResponse::BufferBlock, ServerCommand::Subscribe, payload)
            {
                warn!(client = %self.client_id, sequence, error = %e, "Buffer block retransmission failed");
            }
            self.counters.record_retransmission();
        }
        expired.len()
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<SubscriptionInput>) {
        let mut timer = self.flush_timer();
        let mut pending: Vec<Measurement> = Vec::new();
        let mut frames = FrameBuffer::default();

        loop {
            let lag = self.state.read().settings.lag_time;
            let frame_deadline = frames.deadline(lag);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                input = receiver.recv() => match input {
                    None => break,
                    Some(SubscriptionInput::Measurements(batch)) => {
                        let ready = match self.mode {
                            SubscriptionMode::Synchronized => frames.push(batch, tokio::time::Instant::now()),
                            SubscriptionMode::Unsynchronized => batch,
                        };
                        self.release(ready, timer.is_some(), &mut pending);
                    }
                    Some(SubscriptionInput::ProcessingInterval) => {
                        if !pending.is_empty() {
                            self.publish_logged(std::mem::take(&mut pending));
                        }
                        timer = self.flush_timer();
                    }
                },
                _ = next_tick(&mut timer) => {
                    if !pending.is_empty() {
                        self.publish_logged(std::mem::take(&mut pending));
                    }
                }
                _ = frame_expiry(frame_deadline) => {
                    let ready = frames.expire(tokio::time::Instant::now(), lag);
                    self.release(ready, timer.is_some(), &mut pending);
                }
            }
        }

        frames.clear();
        self.running.store(false, Ordering::Release);
        debug!(client = %self.client_id, "Subscription task exited");
    }

    fn flush_timer(&self) -> Option<Interval> {
        let interval = self.state.read().settings.processing_interval;
        u64::try_from(interval).ok().filter(|ms| *ms > 0).map(|ms| {
            let period = Duration::from_millis(ms);
            let mut timer = interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        })
    }

    /// Publishes `ready` now, or holds it for the next processing interval tick.
    fn release(&self, ready: Vec<Measurement>, interval_active: bool, pending: &mut Vec<Measurement>) {
        if ready.is_empty() {
            return;
        }
        if interval_active {
            pending.extend(ready);
        } else {
            self.publish_logged(ready);
        }
    }

    fn publish_logged(&self, batch: Vec<Measurement>) {
        if let Err(e) = self.publish_batch(batch) {
            warn!(client = %self.client_id, error = %e, "Failed to publish measurements");
        }
    }

    fn publish_batch(&self, batch: Vec<Measurement>) -> Result<()> {
        let (settings, cache) = {
            let state = self.state.read();
            (state.settings.clone(), state.signal_cache.clone())
        };

        let batch: Vec<Measurement> = batch
            .into_iter()
            .filter(|m| cache.index_of(&m.signal_id).is_some())
            .collect();
        let Some(first_time) = batch.iter().map(|m| m.timestamp).min() else {
            return Ok(());
        };

        self.send_start_time(first_time)?;
        let base_times = if settings.compact && settings.use_base_time_offsets {
            Some(self.refresh_base_times(&batch, first_time)?)
        } else {
            None
        };

        match self.mode {
            SubscriptionMode::Unsynchronized => {
                for chunk in batch.chunks(MAX_MEASUREMENTS_PER_PACKET) {
                    self.send_packet(chunk, None, &settings, &cache, base_times.as_ref())?;
                }
            }
            SubscriptionMode::Synchronized => {
                let mut frames: BTreeMap<i64, Vec<Measurement>> = BTreeMap::new();
                for measurement in &batch {
                    frames.entry(measurement.timestamp).or_default().push(*measurement);
                }
                for (timestamp, frame) in &frames {
                    for chunk in frame.chunks(MAX_MEASUREMENTS_PER_PACKET) {
                        self.send_packet(chunk, Some(*timestamp), &settings, &cache, base_times.as_ref())?;
                    }
                }
            }
        }

        let now = now_ticks();
        for measurement in &batch {
            self.counters.record_latency(now - measurement.timestamp);
        }
        self.counters.record_measurements(batch.len());
        Ok(())
    }

    fn send_start_time(&self, timestamp: i64) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.data_start_sent {
                return Ok(());
            }
            state.data_start_sent = true;
        }
        self.sink.send_response(
            ServerResponse::DataStartTime,
            ServerCommand::Subscribe,
            &timestamp.to_be_bytes(),
        )
    }

    /// Moves the base time when any measurement cannot be expressed as an offset.
    fn refresh_base_times(&self, batch: &[Measurement], first_time: i64) -> Result<BaseTimeOffsets> {
        let (offsets, changed) = {
            let mut state = self.state.write();
            let current = state.base_times.get_or_insert_with(BaseTimeOffsets::default);
            let changed = batch.iter().any(|m| current.offset_for(m.timestamp).is_none());
            if changed {
                current.advance(first_time - first_time.rem_euclid(TICKS_PER_SECOND));
            }
            (*current, changed)
        };
        if changed {
            self.sink.send_response(
                ServerResponse::UpdateBaseTimes,
                ServerCommand::Subscribe,
                &offsets.encode(),
            )?;
        }
        Ok(offsets)
    }

    fn send_packet(
        &self,
        measurements: &[Measurement],
        frame_timestamp: Option<i64>,
        settings: &SubscriptionSettings,
        cache: &SignalIndexCache,
        base_times: Option<&BaseTimeOffsets>,
    ) -> Result<()> {
        let mut writer = DataPacketWriter::new(settings.compact, frame_timestamp);
        for measurement in measurements {
            if settings.compact {
                if let Some(index) = cache.index_of(&measurement.signal_id) {
                    writer.push_compact(measurement, index, base_times);
                }
            } else {
                writer.push_full(measurement);
            }
        }
        let payload = writer.finish(settings.compression_strength)?;
        self.sink
            .send_response(ServerResponse::DataPacket, ServerCommand::Subscribe, &payload)
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn frame_expiry(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
