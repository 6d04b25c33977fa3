//! Response envelope: `[response:1][in_response_to:1][length:u32 BE][payload]`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::commands::{ServerCommand, ServerResponse};
use crate::error::{ensure_remaining, CodecError, Result};

/// Fixed size of the response header preceding the payload
pub const RESPONSE_HEADER_SIZE: usize = 6;

/// Encodes a response packet. An empty payload is written as a zero length.
pub fn encode_response(response: ServerResponse, command: ServerCommand, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
    packet.put_u8(response.as_byte());
    packet.put_u8(command.as_byte());
    packet.put_u32(payload.len() as u32);
    packet.put_slice(payload);
    packet.freeze()
}

/// Encodes a client request: `[command][body]`.
pub fn encode_command(command: ServerCommand, body: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(1 + body.len());
    packet.put_u8(command.as_byte());
    packet.put_slice(body);
    packet.freeze()
}

/// Decoded response packet
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub response: ServerResponse,
    pub in_response_to: ServerCommand,
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn decode(packet: &[u8]) -> Result<Self> {
        ensure_remaining(packet, RESPONSE_HEADER_SIZE, "response header")?;
        let mut buf = packet;
        let response = ServerResponse::from_byte(buf.get_u8());
        let in_response_to = ServerCommand::from_byte(buf.get_u8());
        let length = buf.get_u32() as usize;
        if buf.remaining() < length {
            return Err(CodecError::too_small(
                RESPONSE_HEADER_SIZE + length,
                packet.len(),
                "response payload",
            ));
        }

        Ok(Self {
            response,
            in_response_to,
            payload: Bytes::copy_from_slice(&buf[..length]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_header_is_big_endian() {
        let packet = encode_response(ServerResponse::Failed, ServerCommand::Unknown(0xEE), &[1, 2, 3]);
        assert_eq!(&packet[..], &[0x81, 0xEE, 0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn test_empty_payload() {
        let packet = encode_response(ServerResponse::Succeeded, ServerCommand::Unsubscribe, &[]);
        assert_eq!(packet.len(), RESPONSE_HEADER_SIZE);
        let frame = ResponseFrame::decode(&packet).unwrap();
        assert_eq!(frame.response, ServerResponse::Succeeded);
        assert_eq!(frame.in_response_to, ServerCommand::Unsubscribe);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let packet = encode_response(ServerResponse::DataPacket, ServerCommand::Subscribe, &[9; 10]);
        assert!(matches!(
            ResponseFrame::decode(&packet[..8]),
            Err(CodecError::MessageTooSmall { need: 16, got: 8, .. })
        ));
    }

    #[test]
    fn test_command_encoding() {
        let packet = encode_command(ServerCommand::DefineOperationalModes, &[0, 0, 2, 0]);
        assert_eq!(&packet[..], &[0x06, 0, 0, 2, 0]);
    }
}
