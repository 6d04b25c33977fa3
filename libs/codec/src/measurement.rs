//! Measurement serialization and data packet layout
//!
//! Data packet payload (before optional encryption of everything after the flags byte):
//!
//! ```text
//! [flags:u8][frame timestamp:i64 BE, synchronized only][count:u32 BE][measurements]
//! ```
//!
//! When `COMPRESSED` is set, `count || measurements` is a gzip stream.
//!
//! Compact measurement: `[state:u8][runtime index:u16][value:f32][timestamp]` where the
//! timestamp is a `u32` millisecond offset from the active base time when state bit
//! `0x10` is set, otherwise `i64` ticks. Full measurement:
//! `[signal id:16][value:f64][timestamp:i64][flags:u32]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::compression::{gunzip, gzip};
use crate::error::{ensure_remaining, CodecError, Result};
use crate::protocol::DataPacketFlags;
use crate::wire::{get_guid, put_guid};

/// Ticks are 100 ns units
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Measurement flag: value quality is bad
pub const BAD_VALUE: u32 = 0x0000_0001;
/// Measurement flag: timestamp quality is bad
pub const BAD_TIME: u32 = 0x0000_0002;

const STATE_VALUE_BAD: u8 = 0x01;
const STATE_TIME_BAD: u8 = 0x02;
const STATE_BASE_TIME_OFFSET: u8 = 0x10;
const STATE_TIME_INDEX: u8 = 0x20;

const COMPACT_FIXED_SIZE: usize = 1 + 2 + 4;
const FULL_SIZE: usize = 16 + 8 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub signal_id: Uuid,
    pub value: f64,
    /// Ticks (100 ns) since 0001-01-01 UTC
    pub timestamp: i64,
    pub flags: u32,
}

impl Measurement {
    pub fn new(signal_id: Uuid, value: f64, timestamp: i64) -> Self {
        Self {
            signal_id,
            value,
            timestamp,
            flags: 0,
        }
    }
}

/// Pair of base times a compact timestamp offset may be relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BaseTimeOffsets {
    pub index: usize,
    pub bases: [i64; 2],
}

impl BaseTimeOffsets {
    pub const ENCODED_SIZE: usize = 4 + 8 + 8;

    pub fn current(&self) -> i64 {
        self.bases[self.index & 1]
    }

    /// Millisecond offset of `timestamp` from the current base, if representable.
    pub fn offset_for(&self, timestamp: i64) -> Option<u32> {
        let base = self.current();
        if base == 0 || timestamp < base {
            return None;
        }
        u32::try_from((timestamp - base) / TICKS_PER_MILLISECOND).ok()
    }

    /// Moves the other slot to `base` and makes it current, keeping the previous base.
    pub fn advance(&mut self, base: i64) {
        let next = (self.index + 1) & 1;
        self.bases[next] = base;
        self.index = next;
    }

    /// UpdateBaseTimes payload: `[index:i32][base0:i64][base1:i64]`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_SIZE);
        buf.put_i32(self.index as i32);
        buf.put_i64(self.bases[0]);
        buf.put_i64(self.bases[1]);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        ensure_remaining(payload, Self::ENCODED_SIZE, "base time offsets")?;
        let mut buf = payload;
        let index = (buf.get_i32() & 1) as usize;
        let bases = [buf.get_i64(), buf.get_i64()];
        Ok(Self { index, bases })
    }
}

/// Decoded compact measurement as seen by a client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactMeasurement {
    pub runtime_index: u16,
    pub value: f32,
    pub timestamp: i64,
    pub state: u8,
}

impl CompactMeasurement {
    pub fn encode(
        buf: &mut impl BufMut,
        measurement: &Measurement,
        runtime_index: u16,
        base_times: Option<&BaseTimeOffsets>,
    ) {
        let mut state = 0u8;
        if measurement.flags & BAD_VALUE != 0 {
            state |= STATE_VALUE_BAD;
        }
        if measurement.flags & BAD_TIME != 0 {
            state |= STATE_TIME_BAD;
        }

        let offset = base_times.and_then(|b| b.offset_for(measurement.timestamp).map(|o| (b.index, o)));
        if let Some((index, _)) = offset {
            state |= STATE_BASE_TIME_OFFSET;
            if index == 1 {
                state |= STATE_TIME_INDEX;
            }
        }

        buf.put_u8(state);
        buf.put_u16(runtime_index);
        buf.put_f32(measurement.value as f32);
        match offset {
            Some((_, millis)) => buf.put_u32(millis),
            None => buf.put_i64(measurement.timestamp),
        }
    }

    pub fn decode(buf: &mut &[u8], base_times: Option<&BaseTimeOffsets>) -> Result<Self> {
        ensure_remaining(buf, COMPACT_FIXED_SIZE, "compact measurement")?;
        let state = buf.get_u8();
        let runtime_index = buf.get_u16();
        let value = buf.get_f32();

        let timestamp = if state & STATE_BASE_TIME_OFFSET != 0 {
            ensure_remaining(buf, 4, "compact time offset")?;
            let millis = i64::from(buf.get_u32());
            let bases = base_times.ok_or_else(|| {
                CodecError::serialization("compact", "time offset received before base times")
            })?;
            let base = bases.bases[usize::from(state & STATE_TIME_INDEX != 0)];
            base + millis * TICKS_PER_MILLISECOND
        } else {
            ensure_remaining(buf, 8, "compact timestamp")?;
            buf.get_i64()
        };

        Ok(Self {
            runtime_index,
            value,
            timestamp,
            state,
        })
    }
}

pub fn encode_full(buf: &mut impl BufMut, measurement: &Measurement) {
    put_guid(buf, &measurement.signal_id);
    buf.put_f64(measurement.value);
    buf.put_i64(measurement.timestamp);
    buf.put_u32(measurement.flags);
}

pub fn decode_full(buf: &mut &[u8]) -> Result<Measurement> {
    ensure_remaining(buf, FULL_SIZE, "full measurement")?;
    let signal_id = get_guid(buf, "signal id")?;
    Ok(Measurement {
        signal_id,
        value: buf.get_f64(),
        timestamp: buf.get_i64(),
        flags: buf.get_u32(),
    })
}

/// Accumulates measurements into one data packet payload
#[derive(Debug)]
pub struct DataPacketWriter {
    flags: DataPacketFlags,
    frame_timestamp: Option<i64>,
    count: u32,
    body: BytesMut,
}

impl DataPacketWriter {
    /// A frame timestamp marks the packet as synchronized.
    pub fn new(compact: bool, frame_timestamp: Option<i64>) -> Self {
        let mut flags = DataPacketFlags::empty();
        if compact {
            flags |= DataPacketFlags::COMPACT;
        }
        if frame_timestamp.is_some() {
            flags |= DataPacketFlags::SYNCHRONIZED;
        }
        Self {
            flags,
            frame_timestamp,
            count: 0,
            body: BytesMut::new(),
        }
    }

    pub fn push_compact(
        &mut self,
        measurement: &Measurement,
        runtime_index: u16,
        base_times: Option<&BaseTimeOffsets>,
    ) {
        CompactMeasurement::encode(&mut self.body, measurement, runtime_index, base_times);
        self.count += 1;
    }

    pub fn push_full(&mut self, measurement: &Measurement) {
        encode_full(&mut self.body, measurement);
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finishes the payload, gzipping `count || measurements` when a strength is given.
    pub fn finish(self, compression_strength: Option<u32>) -> Result<Bytes> {
        let mut block = BytesMut::with_capacity(4 + self.body.len());
        block.put_u32(self.count);
        block.put_slice(&self.body);

        let mut flags = self.flags;
        let block = match compression_strength {
            Some(strength) => {
                flags |= DataPacketFlags::COMPRESSED;
                Bytes::from(gzip(&block, strength)?)
            }
            None => block.freeze(),
        };

        let mut payload = BytesMut::with_capacity(1 + 8 + block.len());
        payload.put_u8(flags.bits());
        if let Some(timestamp) = self.frame_timestamp {
            payload.put_i64(timestamp);
        }
        payload.put_slice(&block);
        Ok(payload.freeze())
    }
}

/// Parsed (already decrypted) data packet payload
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    pub flags: DataPacketFlags,
    pub frame_timestamp: Option<i64>,
    pub count: u32,
    pub measurements: Bytes,
}

impl DataPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        ensure_remaining(payload, 1, "data packet flags")?;
        let mut buf = payload;
        let flags = DataPacketFlags::from_bits_retain(buf.get_u8());

        let frame_timestamp = if flags.contains(DataPacketFlags::SYNCHRONIZED) {
            ensure_remaining(buf, 8, "frame timestamp")?;
            Some(buf.get_i64())
        } else {
            None
        };

        let block = if flags.contains(DataPacketFlags::COMPRESSED) {
            Bytes::from(gunzip(buf)?)
        } else {
            Bytes::copy_from_slice(buf)
        };
        ensure_remaining(&block, 4, "measurement count")?;
        let mut block_buf = &block[..];
        let count = block_buf.get_u32();
        if count > 0 && block_buf.is_empty() {
            debug!(count, "Data packet declares measurements but carries no body");
        }

        Ok(Self {
            flags,
            frame_timestamp,
            count,
            measurements: block.slice(4..),
        })
    }

    pub fn compact_measurements(&self, base_times: Option<&BaseTimeOffsets>) -> Result<Vec<CompactMeasurement>> {
        let mut buf = &self.measurements[..];
        (0..self.count)
            .map(|_| CompactMeasurement::decode(&mut buf, base_times))
            .collect()
    }

    pub fn full_measurements(&self) -> Result<Vec<Measurement>> {
        let mut buf = &self.measurements[..];
        (0..self.count).map(|_| decode_full(&mut buf)).collect()
    }
}
