//! # Transport Server Library
//!
//! The server half of the secure UDP transport. It admits clients through a
//! stateless retry-token handshake, derives a fresh session per client, and
//! moves encrypted datagrams between the socket and the application.
//!
//! ## Core Responsibilities
//!
//! ### Edge Defense
//! Every datagram passes the [`blacklist::AddressBlacklist`] and the
//! [`rate_limit::RateLimiter`] before anything else looks at it. Both are
//! keyed by source IP and cost O(1) per datagram.
//!
//! ### Admission
//! A `Connect` only earns a pending entry and a signed, time-boxed retry
//! token ([`token::RetryTokenIssuer`]). Keys are derived once the client
//! echoes that token from the same address. A bad token bans that source
//! address (IP and port) and gets exactly one `ConnectionDenied`.
//!
//! ### Session Management
//! Established connections carry a [`shared::SecureLink`]: AEAD sealing,
//! replay protection, reliable delivery and negotiated rekeying.
//!
//! ## Architecture Design
//!
//! ### Three Tasks, One Writer
//! The receive task, the process loop and the send task run on the tokio
//! worker pool and talk over unbounded channels. Only the process loop
//! ([`dispatch::Dispatcher`]) mutates connection state, so per-connection
//! sequence counters need no locks.
//!
//! ### Explicit Context
//! Shared state lives in one [`context::TransportContext`] behind an `Arc`.
//! There are no process-wide singletons, and two servers in one process
//! never interfere.
//!
//! ### Pooled Buffers
//! Datagram buffers come from [`pool::PacketPool`], which keeps a free list
//! per worker thread and only locks when moving batches between threads.
//!
//! ## Module Organization
//!
//! - `config`: [`config::ServerConfig`], JSON loading and validation
//! - `error`: admission, protocol, dispatch and startup errors
//! - `blacklist`, `rate_limit`, `token`: the edge defenses
//! - `connection`, `registry`: per-client state and the concurrent maps that hold it
//! - `dispatch`: handshake, data, heartbeat and timeout handling
//! - `transport`: socket setup, task wiring and [`transport::ServerHandle`]
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::transport::Server;
//! use server::ServerEvent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind(ServerConfig::default()).await?;
//!     let handle = server.handle();
//!     let mut events = server.events().expect("events taken once");
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             if let ServerEvent::Data { connection_id, channel, payload } = event {
//!                 handle.send(connection_id, channel, payload);
//!             }
//!         }
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod blacklist;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub mod token;
pub mod transport;

use std::net::IpAddr;

pub use config::ServerConfig;
pub use dispatch::{DisconnectReason, ServerEvent};
pub use error::ServerError;
pub use transport::{Server, ServerHandle};

/// Collapses IPv4-mapped IPv6 addresses to plain IPv4.
///
/// A dual-stack socket reports IPv4 peers as `::ffff:a.b.c.d`; bans, rate
/// limits and retry tokens must treat both spellings as one source.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
