//! Command and response codes
//!
//! Decoding is a closed match with an `Unknown` arm so an unexpected byte is a
//! value to answer, never a parse failure.

use std::fmt;

/// Client-to-publisher command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCommand {
    Authenticate,
    MetadataRefresh,
    Subscribe,
    Unsubscribe,
    RotateCipherKeys,
    UpdateProcessingInterval,
    DefineOperationalModes,
    ConfirmNotification,
    ConfirmBufferBlock,
    Unknown(u8),
}

impl ServerCommand {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Authenticate,
            0x01 => Self::MetadataRefresh,
            0x02 => Self::Subscribe,
            0x03 => Self::Unsubscribe,
            0x04 => Self::RotateCipherKeys,
            0x05 => Self::UpdateProcessingInterval,
            0x06 => Self::DefineOperationalModes,
            0x07 => Self::ConfirmNotification,
            0x08 => Self::ConfirmBufferBlock,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Authenticate => 0x00,
            Self::MetadataRefresh => 0x01,
            Self::Subscribe => 0x02,
            Self::Unsubscribe => 0x03,
            Self::RotateCipherKeys => 0x04,
            Self::UpdateProcessingInterval => 0x05,
            Self::DefineOperationalModes => 0x06,
            Self::ConfirmNotification => 0x07,
            Self::ConfirmBufferBlock => 0x08,
            Self::Unknown(byte) => byte,
        }
    }

    /// Wire-facing command name used in status messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate => "Authenticate",
            Self::MetadataRefresh => "MetaDataRefresh",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::RotateCipherKeys => "RotateCipherKeys",
            Self::UpdateProcessingInterval => "UpdateProcessingInterval",
            Self::DefineOperationalModes => "DefineOperationalModes",
            Self::ConfirmNotification => "ConfirmNotification",
            Self::ConfirmBufferBlock => "ConfirmBufferBlock",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl From<u8> for ServerCommand {
    fn from(byte: u8) -> Self {
        Self::from_byte(byte)
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(byte) => write!(f, "0x{byte:02X}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Publisher-to-client response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerResponse {
    Succeeded,
    Failed,
    DataPacket,
    UpdateSignalIndexCache,
    UpdateBaseTimes,
    UpdateCipherKeys,
    DataStartTime,
    ProcessingComplete,
    BufferBlock,
    Notify,
    NoOp,
    Unknown(u8),
}

impl ServerResponse {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x80 => Self::Succeeded,
            0x81 => Self::Failed,
            0x82 => Self::DataPacket,
            0x83 => Self::UpdateSignalIndexCache,
            0x84 => Self::UpdateBaseTimes,
            0x85 => Self::UpdateCipherKeys,
            0x86 => Self::DataStartTime,
            0x87 => Self::ProcessingComplete,
            0x88 => Self::BufferBlock,
            0x89 => Self::Notify,
            0xFF => Self::NoOp,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Succeeded => 0x80,
            Self::Failed => 0x81,
            Self::DataPacket => 0x82,
            Self::UpdateSignalIndexCache => 0x83,
            Self::UpdateBaseTimes => 0x84,
            Self::UpdateCipherKeys => 0x85,
            Self::DataStartTime => 0x86,
            Self::ProcessingComplete => 0x87,
            Self::BufferBlock => 0x88,
            Self::Notify => 0x89,
            Self::NoOp => 0xFF,
            Self::Unknown(byte) => byte,
        }
    }

    /// Data packets and buffer blocks may travel over a secondary data channel
    pub fn prefers_data_channel(&self) -> bool {
        matches!(self, Self::DataPacket | Self::BufferBlock)
    }
}

impl From<u8> for ServerResponse {
    fn from(byte: u8) -> Self {
        Self::from_byte(byte)
    }
}
