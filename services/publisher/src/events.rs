//! Publisher notifications for collaborators

use serde::Serialize;
use uuid::Uuid;

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PublisherEvent {
    /// A client completed a subscription
    ClientConnected {
        subscriber_id: Uuid,
        connection_id: String,
        subscriber_info: Option<String>,
    },
    ProcessingComplete {
        source: String,
    },
    StatusMessage {
        message: String,
    },
    ProcessException {
        message: String,
    },
}

impl PublisherEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::StatusMessage {
            message: message.into(),
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self::ProcessException {
            message: message.into(),
        }
    }
}
