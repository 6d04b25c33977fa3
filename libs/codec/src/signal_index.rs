//! Signal index cache
//!
//! Maps the compact 16-bit runtime index carried in compact measurements to the
//! canonical signal identity. Rebuilt whenever a subscription's authorized input
//! set changes; requested-but-unauthorized signals are recorded for diagnostics.
//!
//! Common binary image (big-endian):
//!
//! ```text
//! [total length:i32][subscriber id:16][reference count:i32]
//!   { [index:u16][signal id:16][source:i32 len + text][id:u32] } * count
//! [unauthorized count:i32] { [signal id:16] } * count
//! ```

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ensure_remaining, CodecError, Result};
use crate::text::TextEncoding;
use crate::wire::{get_count, get_guid, get_i32, get_text, put_guid, put_text};

/// Canonical identity of one subscribed signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalReference {
    pub signal_id: Uuid,
    pub source: String,
    pub id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalIndexCache {
    pub subscriber_id: Uuid,
    reference: BTreeMap<u16, SignalReference>,
    pub unauthorized_signal_ids: Vec<Uuid>,
    #[serde(skip)]
    runtime_index: HashMap<Uuid, u16>,
}

impl SignalIndexCache {
    pub fn new(subscriber_id: Uuid) -> Self {
        Self {
            subscriber_id,
            ..Self::default()
        }
    }

    /// Assigns runtime indexes `0..n` to `signals` in order.
    pub fn from_signals(
        subscriber_id: Uuid,
        signals: impl IntoIterator<Item = SignalReference>,
        unauthorized_signal_ids: Vec<Uuid>,
    ) -> Self {
        let mut cache = Self::new(subscriber_id);
        for signal in signals {
            let index = cache.reference.len() as u16;
            cache.insert(index, signal);
        }
        cache.unauthorized_signal_ids = unauthorized_signal_ids;
        cache
    }

    pub fn insert(&mut self, index: u16, signal: SignalReference) {
        self.runtime_index.insert(signal.signal_id, index);
        self.reference.insert(index, signal);
    }

    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    pub fn get(&self, index: u16) -> Option<&SignalReference> {
        self.reference.get(&index)
    }

    pub fn index_of(&self, signal_id: &Uuid) -> Option<u16> {
        self.runtime_index.get(signal_id).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (u16, &SignalReference)> {
        self.reference.iter().map(|(index, signal)| (*index, signal))
    }

    pub fn signal_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.reference.values().map(|signal| signal.signal_id)
    }

    pub fn to_native(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CodecError::serialization("bincode", e.to_string()))
    }

    pub fn from_native(bytes: &[u8]) -> Result<Self> {
        let mut cache: Self = bincode::deserialize(bytes)
            .map_err(|e| CodecError::serialization("bincode", e.to_string()))?;
        cache.rebuild_runtime_index();
        Ok(cache)
    }

    pub fn to_binary_image(&self, encoding: TextEncoding) -> Vec<u8> {
        let mut body = BytesMut::new();
        put_guid(&mut body, &self.subscriber_id);
        body.put_i32(self.reference.len() as i32);
        for (index, signal) in &self.reference {
            body.put_u16(*index);
            put_guid(&mut body, &signal.signal_id);
            put_text(&mut body, encoding, &signal.source);
            body.put_u32(signal.id);
        }
        body.put_i32(self.unauthorized_signal_ids.len() as i32);
        for id in &self.unauthorized_signal_ids {
            put_guid(&mut body, id);
        }

        let mut image = Vec::with_capacity(4 + body.len());
        image.put_i32((4 + body.len()) as i32);
        image.extend_from_slice(&body);
        image
    }

    pub fn from_binary_image(image: &[u8], encoding: TextEncoding) -> Result<Self> {
        let mut buf = image;
        let total = get_count(&mut buf, "signal index cache length")?;
        if total > image.len() {
            return Err(CodecError::too_small(total, image.len(), "signal index cache"));
        }

        let mut cache = Self::new(get_guid(&mut buf, "subscriber id")?);
        let count = get_count(&mut buf, "reference count")?;
        for _ in 0..count {
            ensure_remaining(buf, 2, "runtime index")?;
            let index = buf.get_u16();
            let signal_id = get_guid(&mut buf, "signal id")?;
            let source = get_text(&mut buf, encoding, "signal source")?;
            let id = get_i32(&mut buf, "signal id number")? as u32;
            cache.insert(index, SignalReference { signal_id, source, id });
        }

        let unauthorized = get_count(&mut buf, "unauthorized count")?;
        for _ in 0..unauthorized {
            let id = get_guid(&mut buf, "unauthorized signal id")?;
            cache.unauthorized_signal_ids.push(id);
        }
        Ok(cache)
    }

    fn rebuild_runtime_index(&mut self) {
        self.runtime_index = self
            .reference
            .iter()
            .map(|(index, signal)| (signal.signal_id, *index))
            .collect();
    }
}
