//! CRC32C (Castagnoli) checksums for the datagram trailer.
//!
//! Uses the reflected polynomial `0x82F63B78` with all-ones init and final
//! xor, which is what both peers must agree on. Computed with a 16-way sliced
//! lookup table.
//!
//! This is software only: the `crc` crate has no SSE4.2 or ARMv8 CRC32C
//! instruction path, so every target runs the table version. The wire value
//! is the same either way.

use crc::{Crc, Table, CRC_32_ISCSI};

/// Size of the checksum trailer on every datagram.
pub const CHECKSUM_SIZE: usize = 4;

/// Table-driven on every target; no hardware CRC32C instructions are used.
static CASTAGNOLI: Crc<u32, Table<16>> = Crc::<u32, Table<16>>::new(&CRC_32_ISCSI);

/// Computes the CRC32C of `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// Appends the little-endian CRC32C of the current contents of `buf`.
pub fn append_checksum(buf: &mut Vec<u8>) {
    let sum = crc32c(buf);
    buf.extend_from_slice(&sum.to_le_bytes());
}

/// Checks a buffer whose final four bytes are a little-endian CRC32C trailer.
///
/// Returns the body without the trailer when the checksum matches.
pub fn verify_checksum(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < CHECKSUM_SIZE {
        return None;
    }
    let (body, trailer) = buf.split_at(buf.len() - CHECKSUM_SIZE);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    (crc32c(body) == expected).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_vector() {
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc32c(&[]), 0);
    }

    #[test]
    fn test_distinct_inputs_differ() {
        assert_ne!(crc32c(b"hello"), crc32c(b"world"));
        assert_ne!(crc32c(b"data1"), crc32c(b"data2"));
    }

    #[test]
    fn test_large_buffer_matches_incremental_digest() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut digest = CASTAGNOLI.digest();
        for chunk in data.chunks(37) {
            digest.update(chunk);
        }
        assert_eq!(digest.finalize(), crc32c(&data));
    }

    #[test]
    fn test_append_then_verify() {
        let mut buf = b"payload".to_vec();
        append_checksum(&mut buf);
        assert_eq!(buf.len(), 7 + CHECKSUM_SIZE);
        assert_eq!(verify_checksum(&buf), Some(&b"payload"[..]));
    }

    #[test]
    fn test_verify_rejects_flipped_bit() {
        let mut buf = b"payload".to_vec();
        append_checksum(&mut buf);
        buf[2] ^= 0x01;
        assert_eq!(verify_checksum(&buf), None);
    }

    #[test]
    fn test_verify_rejects_short_buffer() {
        assert_eq!(verify_checksum(&[1, 2, 3]), None);
    }
}
