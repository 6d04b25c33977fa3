//! Per-subscriber notification backlog
//!
//! Notifications are keyed by a stable hash of their text so a client can
//! acknowledge one with ConfirmNotification. The backlog is rewritten to disk on
//! every change so unacknowledged messages survive a restart.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use gateway_codec::TextEncoding;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// FNV-1a 32-bit hash of `text`, reinterpreted as `i32`.
pub fn notification_hash(text: &str) -> i32 {
    const OFFSET_BASIS: u32 = 0x811C_9DC5;
    const PRIME: u32 = 0x0100_0193;
    let hash = text
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME));
    hash as i32
}

/// `[yyyy-MM-dd HH:mm:ss.fff] message`
pub fn stamp_message(message: &str, at: DateTime<Utc>) -> String {
    format!("[{}] {message}", at.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Notify payload: `[hash:i32 BE][text]`
pub fn encode_notify(hash: i32, text: &str, encoding: TextEncoding) -> Vec<u8> {
    let encoded = encoding.encode(text);
    let mut buf = BytesMut::with_capacity(4 + encoded.len());
    buf.put_i32(hash);
    buf.put_slice(&encoded);
    buf.to_vec()
}

#[derive(Debug)]
pub struct NotificationStore {
    path: PathBuf,
    backlog: Mutex<BTreeMap<Uuid, BTreeMap<i32, String>>>,
}

impl NotificationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backlog: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads persisted entries for `known` subscribers; a missing file is empty.
    pub fn load(&self, known: &HashSet<Uuid>) -> Result<usize> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        let mut backlog = self.backlog.lock();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let Some((subscriber, message)) = line.split_once(',') else {
                warn!(line, "Skipping malformed notification line");
                continue;
            };
            let Ok(subscriber_id) = Uuid::parse_str(subscriber.trim()) else {
                warn!(line, "Skipping notification with invalid subscriber id");
                continue;
            };
            if !known.contains(&subscriber_id) {
                continue;
            }
            backlog
                .entry(subscriber_id)
                .or_default()
                .insert(notification_hash(message), message.to_string());
            loaded += 1;
        }
        debug!(path = %self.path.display(), loaded, "Notifications loaded");
        Ok(loaded)
    }

    /// Adds `text` for every subscriber and persists; returns its hash.
    pub fn add_for_all(&self, subscribers: impl IntoIterator<Item = Uuid>, text: &str) -> Result<i32> {
        let hash = notification_hash(text);
        {
            let mut backlog = self.backlog.lock();
            for subscriber_id in subscribers {
                backlog.entry(subscriber_id).or_default().insert(hash, text.to_string());
            }
        }
        self.persist()?;
        Ok(hash)
    }

    /// Removes an acknowledged notification; `Ok(false)` when the hash is unknown.
    pub fn confirm(&self, subscriber_id: &Uuid, hash: i32) -> Result<bool> {
        let removed = {
            let mut backlog = self.backlog.lock();
            let removed = backlog
                .get_mut(subscriber_id)
                .and_then(|entries| entries.remove(&hash))
                .is_some();
            if backlog.get(subscriber_id).is_some_and(BTreeMap::is_empty) {
                backlog.remove(subscriber_id);
            }
            removed
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn pending(&self, subscriber_id: &Uuid) -> Vec<(i32, String)> {
        self.backlog
            .lock()
            .get(subscriber_id)
            .map(|entries| entries.iter().map(|(hash, text)| (*hash, text.clone())).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, subscriber_id: &Uuid) -> usize {
        self.backlog.lock().get(subscriber_id).map_or(0, BTreeMap::len)
    }

    fn persist(&self) -> Result<()> {
        let mut contents = String::new();
        for (subscriber_id, entries) in self.backlog.lock().iter() {
            for text in entries.values() {
                contents.push_str(&format!("{subscriber_id},{text}\n"));
            }
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&self.path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}
