//! Gateway command/response protocol definitions

pub mod commands;
pub mod envelope;
pub mod flags;
pub mod modes;

pub use commands::{ServerCommand, ServerResponse};
pub use envelope::{encode_command, encode_response, ResponseFrame, RESPONSE_HEADER_SIZE};
pub use flags::DataPacketFlags;
pub use modes::{CompressionMode, OperationalModes};
