//! Control payloads carried inside the envelope.
//!
//! All of them go through `bincode` with its default fixed-width little-endian
//! integers, so fixed arrays and integers land on the wire exactly as laid out
//! here with no length prefixes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::session::{PUBLIC_KEY_SIZE, SALT_SIZE};

pub const TOKEN_SIZE: usize = 48;
pub const TOKEN_NONCE_SIZE: usize = 8;
pub const TOKEN_MAC_SIZE: usize = 32;

/// Stateless retry token: `timestamp:i64 | nonce[8] | hmac_sha256[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiSpoofToken {
    /// Unix seconds at issuance.
    pub timestamp: i64,
    pub nonce: [u8; TOKEN_NONCE_SIZE],
    pub mac: [u8; TOKEN_MAC_SIZE],
}

impl AntiSpoofToken {
    pub fn to_bytes(&self) -> [u8; TOKEN_SIZE] {
        let mut out = [0u8; TOKEN_SIZE];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.nonce);
        out[16..48].copy_from_slice(&self.mac);
        out
    }

    /// Parses exactly 48 bytes; any other length is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TOKEN_SIZE {
            return None;
        }
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[0..8]);
        let mut nonce = [0u8; TOKEN_NONCE_SIZE];
        nonce.copy_from_slice(&bytes[8..16]);
        let mut mac = [0u8; TOKEN_MAC_SIZE];
        mac.copy_from_slice(&bytes[16..48]);
        Some(Self {
            timestamp: i64::from_le_bytes(timestamp),
            nonce,
            mac,
        })
    }
}

/// Server → client answer to `Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryChallenge {
    pub token: AntiSpoofToken,
}

/// Client → server echo of the token together with the client's key share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryResponse {
    pub client_public_key: [u8; PUBLIC_KEY_SIZE],
    pub token: AntiSpoofToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAccepted {
    pub connection_id: u32,
    pub server_public_key: [u8; PUBLIC_KEY_SIZE],
    pub salt: [u8; SALT_SIZE],
}

/// Body of both `Ping` and `Pong`; the pong echoes the ping's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Milliseconds on the sender's clock.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub reliable_seq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyRequest {
    /// Stream position both peers bind the next keys to.
    pub current_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyResponse {
    pub accepted: bool,
    pub acknowledged_sequence: u64,
}

/// Plaintext of a reliable datagram flagged `REKEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RekeyControl {
    Request(RekeyRequest),
    Response(RekeyResponse),
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, MessageError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> AntiSpoofToken {
        AntiSpoofToken {
            timestamp: 1_700_000_000,
            nonce: [1, 2, 3, 4, 5, 6, 7, 8],
            mac: [0xAB; TOKEN_MAC_SIZE],
        }
    }

    #[test]
    fn test_token_bincode_matches_manual_layout() {
        let token = sample_token();
        let encoded = encode_message(&token).unwrap();
        assert_eq!(encoded.len(), TOKEN_SIZE);
        assert_eq!(encoded, token.to_bytes());
        assert_eq!(AntiSpoofToken::from_bytes(&encoded), Some(token));
    }

    #[test]
    fn test_token_wrong_length_rejected() {
        assert_eq!(AntiSpoofToken::from_bytes(&[0u8; 47]), None);
        assert_eq!(AntiSpoofToken::from_bytes(&[0u8; 49]), None);
    }

    #[test]
    fn test_retry_response_layout() {
        let message = RetryResponse {
            client_public_key: [7u8; PUBLIC_KEY_SIZE],
            token: sample_token(),
        };
        let encoded = encode_message(&message).unwrap();
        assert_eq!(encoded.len(), PUBLIC_KEY_SIZE + TOKEN_SIZE);
        assert_eq!(&encoded[..32], &[7u8; 32]);
        assert_eq!(&encoded[32..], &sample_token().to_bytes());
    }

    #[test]
    fn test_connection_accepted_layout() {
        let message = ConnectionAccepted {
            connection_id: 0x0102_0304,
            server_public_key: [9u8; PUBLIC_KEY_SIZE],
            salt: [5u8; SALT_SIZE],
        };
        let encoded = encode_message(&message).unwrap();
        assert_eq!(encoded.len(), 4 + 32 + 16);
        assert_eq!(&encoded[..4], &[4, 3, 2, 1]);
        assert_eq!(decode_message::<ConnectionAccepted>(&encoded).unwrap(), message);
    }

    #[test]
    fn test_heartbeat_is_eight_bytes() {
        let encoded = encode_message(&Heartbeat { timestamp: 42 }).unwrap();
        assert_eq!(encoded, 42u64.to_le_bytes());
    }

    #[test]
    fn test_rekey_control_decodes() {
        let request = RekeyControl::Request(RekeyRequest {
            current_sequence: 99,
        });
        let encoded = encode_message(&request).unwrap();
        assert_eq!(decode_message::<RekeyControl>(&encoded).unwrap(), request);
    }

    #[test]
    fn test_short_payload_is_error() {
        assert!(decode_message::<ConnectionAccepted>(&[1, 2, 3]).is_err());
        assert!(decode_message::<Ack>(&[]).is_err());
    }
}
