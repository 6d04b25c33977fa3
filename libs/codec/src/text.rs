//! Client text encodings negotiated through operational modes

use crate::error::{CodecError, Result};

/// Text encoding used for every string exchanged with a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextEncoding {
    #[default]
    Utf16Le,
    Utf16Be,
    Utf8,
    /// Single-byte Latin-1; characters outside it are sent as `?`
    Ansi,
}

impl TextEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf16Le => "UTF-16LE",
            Self::Utf16Be => "UTF-16BE",
            Self::Utf8 => "UTF-8",
            Self::Ansi => "ANSI",
        }
    }

    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Self::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Ansi => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Self::Utf16Le | Self::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    return Err(CodecError::InvalidText {
                        encoding: self.name(),
                        message: format!("odd byte count {}", bytes.len()),
                    });
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| {
                        let pair = [pair[0], pair[1]];
                        if *self == Self::Utf16Le {
                            u16::from_le_bytes(pair)
                        } else {
                            u16::from_be_bytes(pair)
                        }
                    })
                    .collect();
                String::from_utf16(&units).map_err(|e| CodecError::InvalidText {
                    encoding: self.name(),
                    message: e.to_string(),
                })
            }
            Self::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::InvalidText {
                encoding: self.name(),
                message: e.to_string(),
            }),
            Self::Ansi => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}
