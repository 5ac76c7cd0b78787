//! Connection registry for the transport server
//!
//! Connections live in one of two maps:
//! - **pending**: clients that sent `Connect` and were issued a retry token
//!   but have not proven their address yet
//! - **established**: clients that completed the key exchange
//!
//! Both maps are keyed by remote address, since that is all an incoming
//! datagram carries before it is decrypted. A secondary index maps
//! connection ids back to addresses for application sends, and a per-IP
//! count enforces the per-address connection limit.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use log::info;
use rand::Rng;

use crate::canonical_ip;
use crate::connection::Connection;
use crate::error::AdmissionError;

/// Tracks every known connection and enforces capacity limits
///
/// All maps are concurrent so the application handle can read counts from
/// any thread. Mutation of a single connection only ever happens on the
/// process loop, which keeps its session counters single-writer.
#[derive(Debug)]
pub struct ConnectionRegistry {
    pending: DashMap<SocketAddr, Connection>,
    established: DashMap<SocketAddr, Connection>,
    ids: DashMap<u32, SocketAddr>,
    per_ip: DashMap<IpAddr, usize>,
    max_connections: usize,
    max_per_address: usize,
}

impl ConnectionRegistry {
    /// Creates an empty registry with the given global and per-address limits
    pub fn new(max_connections: usize, max_per_address: usize) -> Self {
        Self {
            pending: DashMap::new(),
            established: DashMap::new(),
            ids: DashMap::new(),
            per_ip: DashMap::new(),
            max_connections,
            max_per_address,
        }
    }

    /// Allocates a pending connection for `addr`
    ///
    /// The connection id is random and non-zero so ids cannot be guessed
    /// from the order clients arrived in. Fails with `ServerFull` when the
    /// global limit is reached and `AddressLimit` when the source IP already
    /// holds its share of connections.
    pub fn admit_pending(
        &self,
        addr: SocketAddr,
        connecting_timeout: Duration,
        now: Instant,
    ) -> Result<u32, AdmissionError> {
        if self.len() >= self.max_connections {
            return Err(AdmissionError::ServerFull);
        }
        let ip = canonical_ip(addr.ip());
        {
            let mut count = self.per_ip.entry(ip).or_insert(0);
            if *count >= self.max_per_address {
                return Err(AdmissionError::AddressLimit);
            }
            *count += 1;
        }

        let connection_id = self.allocate_id(addr);
        self.pending.insert(
            addr,
            Connection::new(connection_id, addr, connecting_timeout, now),
        );
        info!("Connection {} pending from {}", connection_id, addr);
        Ok(connection_id)
    }

    fn allocate_id(&self, addr: SocketAddr) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u32 = rng.gen();
            if candidate == 0 {
                continue;
            }
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.ids.entry(candidate) {
                slot.insert(addr);
                return candidate;
            }
        }
    }

    pub fn is_pending(&self, addr: &SocketAddr) -> bool {
        self.pending.contains_key(addr)
    }

    pub fn is_established(&self, addr: &SocketAddr) -> bool {
        self.established.contains_key(addr)
    }

    pub fn pending_mut(&self, addr: &SocketAddr) -> Option<RefMut<'_, SocketAddr, Connection>> {
        self.pending.get_mut(addr)
    }

    pub fn established_mut(
        &self,
        addr: &SocketAddr,
    ) -> Option<RefMut<'_, SocketAddr, Connection>> {
        self.established.get_mut(addr)
    }

    /// Moves a connection from the pending map into the established map
    ///
    /// Returns false if there was no pending entry for `addr`. The caller is
    /// expected to have completed the handshake on the connection first.
    pub fn promote(&self, addr: &SocketAddr) -> bool {
        match self.pending.remove(addr) {
            Some((addr, connection)) => {
                info!(
                    "Connection {} established with {}",
                    connection.connection_id, addr
                );
                self.established.insert(addr, connection);
                true
            }
            None => false,
        }
    }

    /// Resolves an application-facing connection id to its address
    pub fn address_of(&self, connection_id: u32) -> Option<SocketAddr> {
        self.ids.get(&connection_id).map(|addr| *addr)
    }

    /// Removes a connection from whichever map holds it
    ///
    /// Releases its id and its slot in the per-address count. Returns the
    /// removed connection so the caller can report why it went away.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Connection> {
        let (_, connection) = self
            .established
            .remove(addr)
            .or_else(|| self.pending.remove(addr))?;

        self.ids
            .remove_if(&connection.connection_id, |_, owner| owner == addr);
        let ip = canonical_ip(addr.ip());
        let now_empty = match self.per_ip.get_mut(&ip) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if now_empty {
            self.per_ip.remove_if(&ip, |_, count| *count == 0);
        }
        Some(connection)
    }

    /// Pending connections whose handshake deadline has passed
    pub fn expired_pending(&self, now: Instant) -> Vec<SocketAddr> {
        self.pending
            .iter()
            .filter(|entry| entry.is_handshake_expired(now))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Established connections with no authenticated traffic for `timeout`
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        self.established
            .iter()
            .filter(|entry| entry.is_timed_out(now, timeout))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Addresses of every established connection, for periodic work
    pub fn established_addrs(&self) -> Vec<SocketAddr> {
        self.established.iter().map(|entry| *entry.key()).collect()
    }

    /// Connections from `ip`, pending and established alike
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_ip
            .get(&canonical_ip(ip))
            .map_or(0, |count| *count)
    }

    /// Returns the number of pending plus established connections
    pub fn len(&self) -> usize {
        self.pending.len() + self.established.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn established_len(&self) -> usize {
        self.established.len()
    }
}
