//! Outer datagram envelope.
//!
//! ```text
//! [flags:u8][type:u8][reliable_seq:u32 LE, Reliable only][payload...][crc32c:u32 LE]
//! ```
//!
//! Decoding checks the CRC before looking at anything else, so a corrupted
//! datagram never reaches the dispatcher.

use crate::crc::{append_checksum, verify_checksum, CHECKSUM_SIZE};
use crate::error::FrameError;

/// Bytes before the payload when the packet is not reliable.
pub const BASE_HEADER_SIZE: usize = 2;

/// Size of the reliable sequence field.
pub const RELIABLE_SEQ_SIZE: usize = 4;

/// Smallest datagram that can possibly decode.
pub const MIN_DATAGRAM_SIZE: usize = BASE_HEADER_SIZE + CHECKSUM_SIZE;

/// Datagram kinds, shared verbatim between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    RetryToken = 1,
    ConnectionAccepted = 2,
    ConnectionDenied = 3,
    Disconnect = 4,
    Ping = 5,
    Pong = 6,
    Reliable = 7,
    Unreliable = 8,
    Ack = 9,
}

impl PacketType {
    pub const ALL: [PacketType; 10] = [
        PacketType::Connect,
        PacketType::RetryToken,
        PacketType::ConnectionAccepted,
        PacketType::ConnectionDenied,
        PacketType::Disconnect,
        PacketType::Ping,
        PacketType::Pong,
        PacketType::Reliable,
        PacketType::Unreliable,
        PacketType::Ack,
    ];

    /// Whether this type carries the reliable sequence field.
    pub fn is_reliable(self) -> bool {
        self == PacketType::Reliable
    }
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        PacketType::ALL
            .get(value as usize)
            .copied()
            .ok_or(FrameError::UnknownType(value))
    }
}

/// Envelope-level flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Payload is a sealed `PacketHeader` + ciphertext.
    pub const ENCRYPTED: PacketFlags = PacketFlags(1 << 0);
    /// Payload is a rekey control message rather than application data.
    pub const REKEY: PacketFlags = PacketFlags(1 << 2);

    pub const fn from_bits(bits: u8) -> Self {
        PacketFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: PacketFlags) -> Self {
        PacketFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.with(rhs)
    }
}

/// A decoded datagram borrowing its payload from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub flags: PacketFlags,
    pub packet_type: PacketType,
    pub reliable_seq: Option<u32>,
    pub payload: &'a [u8],
}

/// Encodes a datagram ready for `send_to`.
///
/// `reliable_seq` is written only for [`PacketType::Reliable`]; a reliable
/// packet without one is written with sequence zero.
pub fn encode(
    flags: PacketFlags,
    packet_type: PacketType,
    reliable_seq: Option<u32>,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(packet_type, payload.len()));
    encode_into(&mut buf, flags, packet_type, reliable_seq, payload);
    buf
}

/// Same as [`encode`] but appends to a caller-provided (usually pooled) buffer.
pub fn encode_into(
    buf: &mut Vec<u8>,
    flags: PacketFlags,
    packet_type: PacketType,
    reliable_seq: Option<u32>,
    payload: &[u8],
) {
    let start = buf.len();
    buf.push(flags.bits());
    buf.push(packet_type as u8);
    if packet_type.is_reliable() {
        buf.extend_from_slice(&reliable_seq.unwrap_or(0).to_le_bytes());
    }
    buf.extend_from_slice(payload);
    let sum = crate::crc::crc32c(&buf[start..]);
    buf.extend_from_slice(&sum.to_le_bytes());
}

/// Total datagram length for a payload of `payload_len` bytes.
pub fn encoded_len(packet_type: PacketType, payload_len: usize) -> usize {
    let seq = if packet_type.is_reliable() {
        RELIABLE_SEQ_SIZE
    } else {
        0
    };
    BASE_HEADER_SIZE + seq + payload_len + CHECKSUM_SIZE
}

/// Decodes and integrity-checks a datagram.
pub fn decode(datagram: &[u8]) -> Result<Envelope<'_>, FrameError> {
    if datagram.len() < MIN_DATAGRAM_SIZE {
        return Err(FrameError::Truncated);
    }
    let body = verify_checksum(datagram).ok_or(FrameError::Corrupt)?;

    let flags = PacketFlags::from_bits(body[0]);
    let packet_type = PacketType::try_from(body[1])?;
    let rest = &body[BASE_HEADER_SIZE..];

    if packet_type.is_reliable() {
        if rest.len() < RELIABLE_SEQ_SIZE {
            return Err(FrameError::Truncated);
        }
        let (seq, payload) = rest.split_at(RELIABLE_SEQ_SIZE);
        Ok(Envelope {
            flags,
            packet_type,
            reliable_seq: Some(u32::from_le_bytes([seq[0], seq[1], seq[2], seq[3]])),
            payload,
        })
    } else {
        Ok(Envelope {
            flags,
            packet_type,
            reliable_seq: None,
            payload: rest,
        })
    }
}

/// Encodes a datagram that carries no payload at all.
pub fn encode_bare(packet_type: PacketType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_DATAGRAM_SIZE);
    buf.push(PacketFlags::NONE.bits());
    buf.push(packet_type as u8);
    append_checksum(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreliable_layout() {
        let bytes = encode(PacketFlags::NONE, PacketType::Unreliable, None, &[0xAA, 0xBB]);
        assert_eq!(bytes.len(), 2 + 2 + 4);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], PacketType::Unreliable as u8);
        assert_eq!(&bytes[2..4], &[0xAA, 0xBB]);

        let env = decode(&bytes).unwrap();
        assert_eq!(env.packet_type, PacketType::Unreliable);
        assert_eq!(env.reliable_seq, None);
        assert_eq!(env.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_reliable_carries_sequence() {
        let bytes = encode(
            PacketFlags::ENCRYPTED,
            PacketType::Reliable,
            Some(0x0102_0304),
            b"abc",
        );
        assert_eq!(&bytes[2..6], &[0x04, 0x03, 0x02, 0x01]);

        let env = decode(&bytes).unwrap();
        assert!(env.flags.contains(PacketFlags::ENCRYPTED));
        assert_eq!(env.reliable_seq, Some(0x0102_0304));
        assert_eq!(env.payload, b"abc");
    }

    #[test]
    fn test_bare_packet() {
        let bytes = encode_bare(PacketType::Connect);
        assert_eq!(bytes.len(), MIN_DATAGRAM_SIZE);
        let env = decode(&bytes).unwrap();
        assert_eq!(env.packet_type, PacketType::Connect);
        assert!(env.payload.is_empty());
    }

    #[test]
    fn test_corrupt_payload_fails_closed() {
        let mut bytes = encode(PacketFlags::NONE, PacketType::Unreliable, None, b"hello");
        bytes[3] ^= 0x80;
        assert_eq!(decode(&bytes), Err(FrameError::Corrupt));
    }

    #[test]
    fn test_corrupt_trailer_fails_closed() {
        let mut bytes = encode_bare(PacketType::Ping);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(decode(&bytes), Err(FrameError::Corrupt));
    }

    #[test]
    fn test_truncated_inputs() {
        assert_eq!(decode(&[]), Err(FrameError::Truncated));
        assert_eq!(decode(&[0, 7, 1]), Err(FrameError::Truncated));

        // A reliable packet whose body is too short for the sequence field.
        let mut short = vec![0u8, PacketType::Reliable as u8, 1];
        append_checksum(&mut short);
        assert_eq!(decode(&short), Err(FrameError::Truncated));
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = vec![0u8, 200];
        append_checksum(&mut bytes);
        assert_eq!(decode(&bytes), Err(FrameError::UnknownType(200)));
    }

    #[test]
    fn test_packet_type_table_matches_discriminants() {
        for (index, packet_type) in PacketType::ALL.iter().enumerate() {
            assert_eq!(*packet_type as usize, index);
            assert_eq!(PacketType::try_from(index as u8), Ok(*packet_type));
        }
    }

    #[test]
    fn test_encoded_len_matches_output() {
        for packet_type in PacketType::ALL {
            let bytes = encode(PacketFlags::NONE, packet_type, Some(9), &[1; 17]);
            assert_eq!(bytes.len(), encoded_len(packet_type, 17));
        }
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = Vec::with_capacity(64);
        encode_into(&mut buf, PacketFlags::REKEY, PacketType::Reliable, Some(3), b"x");
        let env = decode(&buf).unwrap();
        assert!(env.flags.contains(PacketFlags::REKEY));
        assert_eq!(env.reliable_seq, Some(3));
    }
}
