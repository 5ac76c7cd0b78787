use std::io;

use shared::{CryptoError, FrameError, LinkError, MessageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("could not resolve server address {0}")]
    Address(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("server denied the connection")]
    Denied,
    #[error("not connected")]
    NotConnected,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Link(#[from] LinkError),
}
