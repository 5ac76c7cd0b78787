//! # Transport Protocol Library
//!
//! Everything both ends of the secure UDP transport must agree on byte for
//! byte. The server and client crates build their I/O loops on top of this
//! crate and never touch wire formats or key material directly.
//!
//! ## Layers
//!
//! ### Envelope (`framing`, `crc`)
//! Every datagram is `flags | type | [reliable_seq] | payload | crc32c`. The
//! CRC32C trailer is verified before anything else is parsed, so a
//! corrupted datagram is dropped without reaching any handler.
//!
//! ### Control Messages (`messages`)
//! Handshake, heartbeat, ack and rekey payloads, encoded with `bincode`. The
//! 48-byte retry token is defined here so that the client can carry it
//! opaquely while only the server can mint or verify it.
//!
//! ### Session Crypto (`session`, `header`, `replay`)
//! X25519 key agreement, HKDF-SHA256 key schedule and ChaCha20-Poly1305
//! sealing. A 14-byte [`PacketHeader`] is bound into every ciphertext as
//! associated data, and a 64-entry sliding window rejects replayed
//! sequence numbers before the cipher runs.
//!
//! ### Link (`link`)
//! Reliable delivery with acks and retransmission, plus the propose/ack
//! exchange that lets both peers rotate keys at the same stream position.
//!
//! ## Handshake
//!
//! ```text
//! client                                   server
//!   | Connect                                |
//!   |--------------------------------------->|  pending entry, no keys yet
//!   |                        RetryToken(tok) |
//!   |<---------------------------------------|
//!   | RetryToken(client_pub, tok)            |
//!   |--------------------------------------->|  token verified, keys derived
//!   |  ConnectionAccepted(id, server_pub, salt)
//!   |<---------------------------------------|
//!   | Unreliable / Reliable (sealed)         |
//!   |<======================================>|
//! ```

pub mod crc;
pub mod error;
pub mod framing;
pub mod header;
pub mod link;
pub mod messages;
pub mod replay;
pub mod session;
pub mod state;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use error::{CryptoError, DecryptError, FrameError, LinkError, MessageError};
pub use framing::{Envelope, PacketFlags, PacketType};
pub use header::{Channel, HeaderFlags, PacketHeader};
pub use link::{LinkConfig, Received, SecureLink};
pub use messages::AntiSpoofToken;
pub use replay::ReplayWindow;
pub use session::{RekeyPolicy, Role, SecureSession};
pub use state::ConnectionState;

/// Largest datagram either peer puts on the wire.
pub const MAX_PACKET_SIZE: usize = 1200;

pub const DEFAULT_PORT: u16 = 8080;

/// Milliseconds since the Unix epoch, used for heartbeat timestamps.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Seconds since the Unix epoch, used for retry token timestamps.
pub fn timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
