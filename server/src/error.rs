//! Server error types.
//!
//! Only [`ServerError`] is fatal, and only at startup. Everything the
//! dispatcher returns is logged and the datagram is dropped.

use std::io;
use std::net::SocketAddr;

use shared::{ConnectionState, CryptoError, FrameError, LinkError, MessageError, PacketType};
use thiserror::Error;

/// Why a datagram or handshake was refused at the edge.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("source address is banned")]
    Banned,
    #[error("source address exceeded its rate limit")]
    RateLimited,
    #[error("retry token invalid or expired")]
    InvalidToken,
    #[error("connection limit reached")]
    ServerFull,
    #[error("too many connections from this address")]
    AddressLimit,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet type {0:?} not expected here")]
    UnexpectedPacketType(PacketType),
    #[error("no connection for source address")]
    UnknownConnection,
    #[error("connection in state {0:?} cannot accept this packet")]
    InvalidState(ConnectionState),
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Anything that can go wrong handling one inbound datagram.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid bind address {0}")]
    Address(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServerError {
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        ServerError::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}
