use bitflags::bitflags;

bitflags! {
    /// First byte of every data packet payload; also the Subscribe request flags byte.
    ///
    /// The byte is always sent in the clear so a client can pick the cipher
    /// pair named by `CIPHER_INDEX` before decrypting the rest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataPacketFlags: u8 {
        const SYNCHRONIZED = 0x01;
        const COMPACT = 0x02;
        const CIPHER_INDEX = 0x04;
        const COMPRESSED = 0x08;
        const LITTLE_ENDIAN_COMPRESSION = 0x10;
    }
}

impl DataPacketFlags {
    pub fn cipher_index(&self) -> usize {
        usize::from(self.contains(Self::CIPHER_INDEX))
    }
}
