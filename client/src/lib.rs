//! # Transport Client Library
//!
//! A headless client for the secure UDP transport. It performs the
//! retry-token handshake, seals and opens application traffic, and keeps the
//! connection alive by answering the server's heartbeats and rekey
//! proposals.
//!
//! ## Connection Lifecycle
//!
//! ### Handshake
//! [`Client::connect`] sends `Connect`, echoes the server's retry token
//! together with a fresh X25519 public key, and derives the session from the
//! `ConnectionAccepted` reply. Lost datagrams are covered by resending the
//! current request every `retry_interval`; the whole exchange is bounded by
//! `handshake_timeout`.
//!
//! ### Established Traffic
//! Payloads go out on the unreliable channel (sealed, fire and forget) or
//! the reliable channel (sealed, acked, retransmitted). Incoming data comes
//! back from [`Client::poll`] as [`ClientEvent::Data`].
//!
//! ### Keep-Alive and Rekeying
//! While inside `poll`, the client answers `Ping` with `Pong`, acks reliable
//! datagrams, and takes part in key rotation. Nothing runs in the background,
//! so an application that stops polling will eventually be timed out by the
//! server.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Client, ClientConfig, ClientEvent};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), client::ClientError> {
//!     let mut client = Client::bind(ClientConfig::default()).await?;
//!     client.connect().await?;
//!     client.send_reliable(b"hello").await?;
//!
//!     if let Some(ClientEvent::Data { payload, .. }) = client.poll(Duration::from_secs(1)).await? {
//!         println!("echo: {:?}", payload);
//!     }
//!
//!     client.disconnect().await
//! }
//! ```

pub mod error;
pub mod network;

pub use error::ClientError;
pub use network::{Client, ClientConfig, ClientEvent};
