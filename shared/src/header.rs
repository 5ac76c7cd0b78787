//! The 14-byte header bound into every sealed datagram as associated data.

use crate::error::DecryptError;

/// Delivery class recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Unreliable = 0,
    Reliable = 1,
}

impl TryFrom<u8> for Channel {
    type Error = DecryptError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Channel::Unreliable),
            1 => Ok(Channel::Reliable),
            _ => Err(DecryptError::Malformed),
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const NONE: HeaderFlags = HeaderFlags(0);
    pub const ENCRYPTED: HeaderFlags = HeaderFlags(1 << 0);
    pub const AEAD_CHACHA20_POLY1305: HeaderFlags = HeaderFlags(1 << 1);
    /// Set while the sender is on an odd key phase.
    pub const KEY_PHASE: HeaderFlags = HeaderFlags(1 << 2);

    pub const fn from_bits(bits: u8) -> Self {
        HeaderFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: HeaderFlags) -> Self {
        HeaderFlags(self.0 | other.0)
    }

    pub fn key_phase(self) -> bool {
        self.contains(HeaderFlags::KEY_PHASE)
    }
}

/// `connection_id:u32 | channel:u8 | flags:u8 | sequence:u64`, little-endian, packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub connection_id: u32,
    pub channel: Channel,
    pub flags: HeaderFlags,
    pub sequence: u64,
}

impl PacketHeader {
    pub const SIZE: usize = 14;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.connection_id.to_le_bytes());
        out[4] = self.channel as u8;
        out[5] = self.flags.bits();
        out[6..14].copy_from_slice(&self.sequence.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecryptError> {
        if bytes.len() < Self::SIZE {
            return Err(DecryptError::Malformed);
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[0..4]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[6..14]);
        Ok(PacketHeader {
            connection_id: u32::from_le_bytes(id),
            channel: Channel::try_from(bytes[4])?,
            flags: HeaderFlags::from_bits(bytes[5]),
            sequence: u64::from_le_bytes(seq),
        })
    }

    /// Reads the sequence out of serialized header bytes without validating the rest.
    pub fn sequence_of(bytes: &[u8; Self::SIZE]) -> u64 {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[6..14]);
        u64::from_le_bytes(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_packed_little_endian() {
        let header = PacketHeader {
            connection_id: 0x1122_3344,
            channel: Channel::Reliable,
            flags: HeaderFlags::ENCRYPTED.with(HeaderFlags::AEAD_CHACHA20_POLY1305),
            sequence: 0x0102_0304_0506_0708,
        };
        let bytes = header.to_bytes();
        assert_eq!(
            bytes,
            [0x44, 0x33, 0x22, 0x11, 1, 0b011, 8, 7, 6, 5, 4, 3, 2, 1]
        );
        assert_eq!(PacketHeader::from_bytes(&bytes), Ok(header));
        assert_eq!(PacketHeader::sequence_of(&bytes), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_short_header_is_malformed() {
        assert_eq!(
            PacketHeader::from_bytes(&[0u8; 13]),
            Err(DecryptError::Malformed)
        );
    }

    #[test]
    fn test_unknown_channel_is_malformed() {
        let mut bytes = [0u8; PacketHeader::SIZE];
        bytes[4] = 9;
        assert_eq!(PacketHeader::from_bytes(&bytes), Err(DecryptError::Malformed));
    }

    #[test]
    fn test_key_phase_flag() {
        assert!(!HeaderFlags::ENCRYPTED.key_phase());
        assert!(HeaderFlags::ENCRYPTED.with(HeaderFlags::KEY_PHASE).key_phase());
    }
}
