//! Per-client connection state on the server.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;
use shared::session::PUBLIC_KEY_SIZE;
use shared::{ConnectionState, SecureLink};

/// One client, from its first `Connect` until it is removed.
///
/// A connection starts out pending with no key material at all. The
/// [`SecureLink`] only exists once the retry token has been verified and the
/// key exchange has run.
#[derive(Debug)]
pub struct Connection {
    /// Random, non-zero identifier bound into every AEAD nonce.
    pub connection_id: u32,
    pub remote_address: SocketAddr,
    state: ConnectionState,
    link: Option<SecureLink>,
    /// Pending connections are dropped once this passes.
    pub connecting_deadline: Instant,
    /// Last time an authenticated datagram arrived.
    pub last_activity: Instant,
    pub ping_rtt: Option<Duration>,
    /// Timestamp of the last ping we sent, echoed back by a genuine pong.
    last_ping: Option<u64>,
    client_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    /// `ConnectionAccepted` datagram, resent if the client never saw it.
    accepted: Option<Vec<u8>>,
}

impl Connection {
    pub fn new(
        connection_id: u32,
        remote_address: SocketAddr,
        connecting_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            connection_id,
            remote_address,
            state: ConnectionState::Connecting,
            link: None,
            connecting_deadline: now + connecting_timeout,
            last_activity: now,
            ping_rtt: None,
            last_ping: None,
            client_public_key: None,
            accepted: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Moves to `next` if the lifecycle allows it; anything else is ignored.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            debug!(
                "Connection {} {:?} -> {:?}",
                self.connection_id, self.state, next
            );
            self.state = next;
            true
        } else {
            debug!(
                "Connection {} ignoring transition {:?} -> {:?}",
                self.connection_id, self.state, next
            );
            false
        }
    }

    /// Completes the handshake. Only a `Connecting` connection can be established.
    pub fn establish(
        &mut self,
        link: SecureLink,
        client_public_key: [u8; PUBLIC_KEY_SIZE],
        accepted: Vec<u8>,
        now: Instant,
    ) -> bool {
        if !self.transition(ConnectionState::Connected) {
            return false;
        }
        self.link = Some(link);
        self.client_public_key = Some(client_public_key);
        self.accepted = Some(accepted);
        self.last_activity = now;
        true
    }

    pub fn begin_disconnect(&mut self) -> bool {
        self.transition(ConnectionState::Disconnecting)
    }

    pub fn finish_disconnect(&mut self) -> bool {
        self.transition(ConnectionState::Disconnected)
    }

    pub fn link(&self) -> Option<&SecureLink> {
        self.link.as_ref()
    }

    pub fn link_mut(&mut self) -> Option<&mut SecureLink> {
        self.link.as_mut()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_handshake_expired(&self, now: Instant) -> bool {
        self.state == ConnectionState::Connecting && now >= self.connecting_deadline
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.state == ConnectionState::Connected
            && now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn record_ping(&mut self, timestamp_ms: u64) {
        self.last_ping = Some(timestamp_ms);
    }

    /// Accepts a pong only if it echoes the last ping sent.
    pub fn record_pong(&mut self, echoed_ms: u64, now_ms: u64, now: Instant) -> bool {
        if self.last_ping != Some(echoed_ms) {
            return false;
        }
        self.last_ping = None;
        self.ping_rtt = Some(Duration::from_millis(now_ms.saturating_sub(echoed_ms)));
        self.touch(now);
        true
    }

    /// The cached `ConnectionAccepted` for a client retrying the same handshake.
    ///
    /// Once the client has sent authenticated data it evidently has the
    /// keys, and the cache is no longer offered.
    pub fn cached_accept(&self, client_public_key: &[u8; PUBLIC_KEY_SIZE]) -> Option<&[u8]> {
        let received = self.link.as_ref().map_or(false, |link| link.has_received());
        if received || self.client_public_key.as_ref() != Some(client_public_key) {
            return None;
        }
        self.accepted.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::link::LinkConfig;
    use shared::session::{Role, SecureSession};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_link(connection_id: u32) -> SecureLink {
        let session =
            SecureSession::from_key_material(Role::Server, connection_id, &[3u8; 64], [4u8; 16]);
        SecureLink::new(session, LinkConfig::default())
    }

    fn pending(now: Instant) -> Connection {
        Connection::new(9, test_addr(), Duration::from_secs(3), now)
    }

    #[test]
    fn test_connection_creation() {
        let now = Instant::now();
        let connection = pending(now);
        assert_eq!(connection.connection_id, 9);
        assert_eq!(connection.remote_address, test_addr());
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(connection.link().is_none());
        assert_eq!(connection.connecting_deadline, now + Duration::from_secs(3));
    }

    #[test]
    fn test_establish_once() {
        let now = Instant::now();
        let mut connection = pending(now);
        assert!(connection.establish(test_link(9), [1u8; 32], vec![1, 2, 3], now));
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(connection.link().is_some());

        assert!(!connection.establish(test_link(9), [2u8; 32], vec![4], now));
        assert_eq!(connection.cached_accept(&[1u8; 32]), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_invalid_transitions_are_ignored() {
        let now = Instant::now();
        let mut connection = pending(now);
        assert!(!connection.transition(ConnectionState::Connecting));
        assert_eq!(connection.state(), ConnectionState::Connecting);

        let mut connection = pending(now);
        connection.establish(test_link(9), [1u8; 32], Vec::new(), now);
        assert!(!connection.transition(ConnectionState::Connecting));
        assert!(!connection.finish_disconnect());
        assert!(connection.begin_disconnect());
        assert!(connection.finish_disconnect());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.begin_disconnect());
    }

    #[test]
    fn test_handshake_deadline() {
        let now = Instant::now();
        let connection = pending(now);
        assert!(!connection.is_handshake_expired(now + Duration::from_millis(2_999)));
        assert!(connection.is_handshake_expired(now + Duration::from_secs(3)));
    }

    #[test]
    fn test_activity_timeout() {
        let now = Instant::now();
        let mut connection = pending(now);
        // Pending connections use the handshake deadline instead.
        assert!(!connection.is_timed_out(now + Duration::from_secs(60), Duration::from_secs(30)));

        connection.establish(test_link(9), [1u8; 32], Vec::new(), now);
        assert!(!connection.is_timed_out(now + Duration::from_secs(30), Duration::from_secs(30)));
        assert!(connection.is_timed_out(now + Duration::from_secs(31), Duration::from_secs(30)));

        connection.touch(now + Duration::from_secs(31));
        assert!(!connection.is_timed_out(now + Duration::from_secs(31), Duration::from_secs(30)));
    }

    #[test]
    fn test_pong_must_echo_last_ping() {
        let now = Instant::now();
        let mut connection = pending(now);
        connection.record_ping(1_000);
        assert!(!connection.record_pong(999, 1_040, now));
        assert!(connection.ping_rtt.is_none());

        assert!(connection.record_pong(1_000, 1_040, now));
        assert_eq!(connection.ping_rtt, Some(Duration::from_millis(40)));
        // The same pong does not count twice.
        assert!(!connection.record_pong(1_000, 1_090, now));
    }

    #[test]
    fn test_cached_accept_requires_same_key() {
        let now = Instant::now();
        let mut connection = pending(now);
        assert!(connection.cached_accept(&[1u8; 32]).is_none());
        connection.establish(test_link(9), [1u8; 32], vec![7], now);
        assert!(connection.cached_accept(&[2u8; 32]).is_none());
        assert!(connection.cached_accept(&[1u8; 32]).is_some());
    }
}
