//! Operational mode negotiation flags
//!
//! Layout of the `u32` a client sends with DefineOperationalModes:
//!
//! ```text
//! bits 0-4   protocol version
//! bits 5-7   compression mode (0x20 = gzip)
//! bits 8-9   text encoding (00 UTF-16LE, 01 UTF-16BE, 10 UTF-8, 11 ANSI)
//! bit  24    use common serialization format
//! bit  29    compress payload data
//! bit  30    compress signal index cache
//! bit  31    compress metadata
//! ```

use bitflags::bitflags;

use crate::text::TextEncoding;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OperationalModes: u32 {
        const VERSION_MASK = 0x0000_001F;
        const COMPRESSION_MODE_MASK = 0x0000_00E0;
        const ENCODING_MASK = 0x0000_0300;
        const USE_COMMON_SERIALIZATION_FORMAT = 0x0100_0000;
        const COMPRESS_PAYLOAD_DATA = 0x2000_0000;
        const COMPRESS_SIGNAL_INDEX_CACHE = 0x4000_0000;
        const COMPRESS_METADATA = 0x8000_0000;
    }
}

impl Default for OperationalModes {
    fn default() -> Self {
        Self::empty()
    }
}

const GZIP_MODE: u32 = 0x0000_0020;

const ENCODING_UTF16_BE: u32 = 0x0000_0100;
const ENCODING_UTF8: u32 = 0x0000_0200;
const ENCODING_ANSI: u32 = 0x0000_0300;

/// Compression algorithm selected in bits 5-7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    GZip,
    Other(u8),
}

impl OperationalModes {
    /// Builds modes from the raw wire value, keeping unassigned bits.
    pub fn from_wire(value: u32) -> Self {
        Self::from_bits_retain(value)
    }

    pub fn version(&self) -> u8 {
        (self.bits() & Self::VERSION_MASK.bits()) as u8
    }

    pub fn compression_mode(&self) -> CompressionMode {
        match self.bits() & Self::COMPRESSION_MODE_MASK.bits() {
            0 => CompressionMode::None,
            GZIP_MODE => CompressionMode::GZip,
            other => CompressionMode::Other((other >> 5) as u8),
        }
    }

    pub fn encoding(&self) -> TextEncoding {
        match self.bits() & Self::ENCODING_MASK.bits() {
            ENCODING_UTF16_BE => TextEncoding::Utf16Be,
            ENCODING_UTF8 => TextEncoding::Utf8,
            ENCODING_ANSI => TextEncoding::Ansi,
            _ => TextEncoding::Utf16Le,
        }
    }

    pub fn with_version(self, version: u8) -> Self {
        let bits = (self.bits() & !Self::VERSION_MASK.bits())
            | (u32::from(version) & Self::VERSION_MASK.bits());
        Self::from_bits_retain(bits)
    }

    pub fn with_gzip(self) -> Self {
        let bits = (self.bits() & !Self::COMPRESSION_MODE_MASK.bits()) | GZIP_MODE;
        Self::from_bits_retain(bits)
    }

    pub fn with_encoding(self, encoding: TextEncoding) -> Self {
        let field = match encoding {
            TextEncoding::Utf16Le => 0,
            TextEncoding::Utf16Be => ENCODING_UTF16_BE,
            TextEncoding::Utf8 => ENCODING_UTF8,
            TextEncoding::Ansi => ENCODING_ANSI,
        };
        Self::from_bits_retain((self.bits() & !Self::ENCODING_MASK.bits()) | field)
    }

    pub fn uses_common_serialization(&self) -> bool {
        self.contains(Self::USE_COMMON_SERIALIZATION_FORMAT)
    }

    /// Gzip is applied only when the compress flag is set and the mode is gzip
    pub fn gzip_enabled_for(&self, flag: OperationalModes) -> bool {
        self.contains(flag) && self.compression_mode() == CompressionMode::GZip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_modes_default_to_utf16le() {
        let modes = OperationalModes::default();
        assert_eq!(modes.version(), 0);
        assert_eq!(modes.encoding(), TextEncoding::Utf16Le);
        assert_eq!(modes.compression_mode(), CompressionMode::None);
        assert!(!modes.uses_common_serialization());
    }

    #[test]
    fn test_bit_layout() {
        let modes = OperationalModes::from_wire(0x8100_0221);
        assert_eq!(modes.version(), 1);
        assert_eq!(modes.compression_mode(), CompressionMode::GZip);
        assert_eq!(modes.encoding(), TextEncoding::Utf8);
        assert!(modes.uses_common_serialization());
        assert!(modes.gzip_enabled_for(OperationalModes::COMPRESS_METADATA));
        assert!(!modes.gzip_enabled_for(OperationalModes::COMPRESS_SIGNAL_INDEX_CACHE));
    }

    #[test]
    fn test_compress_flag_without_gzip_mode() {
        let modes = OperationalModes::COMPRESS_PAYLOAD_DATA;
        assert!(!modes.gzip_enabled_for(OperationalModes::COMPRESS_PAYLOAD_DATA));
    }

    #[test]
    fn test_builders_compose() {
        let modes = OperationalModes::empty()
            .with_version(2)
            .with_encoding(TextEncoding::Ansi)
            .with_gzip();
        assert_eq!(modes.bits(), 0x0000_0322);
        assert_eq!(modes.with_encoding(TextEncoding::Utf16Be).encoding(), TextEncoding::Utf16Be);
    }
}
