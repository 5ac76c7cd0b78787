//! Error taxonomy for everything a peer can reject on the wire.
//!
//! None of these are fatal: the transport recovers from each of them by
//! dropping the offending datagram.

use thiserror::Error;

/// Failures decoding the outer envelope of a datagram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer is shorter than the envelope it declares.
    #[error("datagram truncated")]
    Truncated,
    /// The CRC32C trailer does not match the contents.
    #[error("datagram checksum mismatch")]
    Corrupt,
    /// The packet type byte is not one this protocol knows.
    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// Failures opening an encrypted datagram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    /// The sequence number was already accepted or fell out of the window.
    #[error("replayed or stale sequence number")]
    Replay,
    /// The authentication tag did not verify.
    #[error("authentication tag mismatch")]
    Forged,
    /// The sequence bound into the header differs from the one claimed.
    #[error("header sequence does not match claimed sequence")]
    SequenceMismatch,
    /// The header names a different connection.
    #[error("header belongs to another connection")]
    WrongConnection,
    /// The header was sealed under a key phase this peer no longer holds.
    #[error("packet sealed under a retired key phase")]
    StaleKeyPhase,
    /// Too short to contain a header and a tag.
    #[error("encrypted payload malformed")]
    Malformed,
}

/// Failures establishing or using key material.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The peer's public key produced an all-zero shared secret.
    #[error("key exchange produced a non-contributory shared secret")]
    NonContributory,
    /// HKDF refused the requested output length.
    #[error("key derivation failed")]
    KeyDerivation,
    /// The AEAD refused to seal the payload.
    #[error("failed to seal payload")]
    Seal,
}

/// A control payload could not be encoded or decoded.
#[derive(Debug, Error)]
#[error("malformed control message: {0}")]
pub struct MessageError(#[from] pub bincode::Error);

/// Failures handling an encrypted datagram on an established link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Message(#[from] MessageError),
    /// The envelope is not flagged as encrypted.
    #[error("plaintext datagram on an encrypted link")]
    NotEncrypted,
    /// The envelope type never carries link traffic.
    #[error("packet type {0:?} is not link traffic")]
    UnexpectedType(crate::framing::PacketType),
    /// The authenticated reliable sequence differs from the envelope's.
    #[error("reliable sequence does not match sealed sequence")]
    ReliableMismatch,
}
