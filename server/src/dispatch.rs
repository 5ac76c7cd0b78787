//! Process loop logic: admission, framing, the handshake, and everything
//! else that happens between a datagram leaving the socket and a reply being
//! queued for sending.
//!
//! The [`Dispatcher`] is the only writer of connection state. It runs on a
//! single task, so every session's sequence counters and replay window are
//! mutated by one thread at a time without a per-connection lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use shared::framing::{self, Envelope, PacketFlags, PacketType};
use shared::link::max_payload;
use shared::messages::{
    decode_message, encode_message, ConnectionAccepted, Heartbeat, RetryChallenge,
    RetryResponse, TOKEN_SIZE,
};
use shared::session::PUBLIC_KEY_SIZE;
use shared::{timestamp_millis, Channel, ConnectionState, SecureLink, SecureSession};
use tokio::sync::mpsc::UnboundedSender;

use crate::blacklist::DEFAULT_SWEEP_BUDGET;
use crate::context::TransportContext;
use crate::error::{AdmissionError, DispatchError, ProtocolError};

/// Exact size of a client's `RetryToken` payload.
pub const RETRY_RESPONSE_SIZE: usize = PUBLIC_KEY_SIZE + TOKEN_SIZE;

/// Limiter buckets idle this long (and full again) are forgotten.
const LIMITER_IDLE: Duration = Duration::from_secs(1);

/// A datagram read from the socket.
#[derive(Debug)]
pub struct Inbound {
    pub buffer: Vec<u8>,
    pub addr: SocketAddr,
}

/// A complete datagram waiting for the send task.
#[derive(Debug)]
pub struct Outgoing {
    pub buffer: Vec<u8>,
    pub addr: SocketAddr,
}

/// Requests from the application, routed through the process loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send {
        connection_id: u32,
        channel: Channel,
        payload: Vec<u8>,
    },
    Disconnect {
        connection_id: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent `Disconnect`.
    Requested,
    TimedOut,
    /// The application closed the connection.
    Kicked,
    Shutdown,
}

/// What the application sees of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected {
        connection_id: u32,
        addr: SocketAddr,
    },
    Data {
        connection_id: u32,
        channel: Channel,
        payload: Vec<u8>,
    },
    Disconnected {
        connection_id: u32,
        reason: DisconnectReason,
    },
}

pub struct Dispatcher {
    ctx: Arc<TransportContext>,
    outgoing: UnboundedSender<Outgoing>,
    events: UnboundedSender<ServerEvent>,
    last_heartbeat: Instant,
    last_sweep: Instant,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<TransportContext>,
        outgoing: UnboundedSender<Outgoing>,
        events: UnboundedSender<ServerEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            outgoing,
            events,
            last_heartbeat: now,
            last_sweep: now,
        }
    }

    /// Handles one datagram. Every failure ends with the datagram dropped.
    pub fn handle_datagram(&mut self, datagram: &[u8], addr: SocketAddr, now: Instant) {
        match self.dispatch(datagram, addr, now) {
            Ok(()) => {}
            Err(DispatchError::Admission(reason)) => {
                self.ctx.counters.record_dropped();
                trace!("Dropped datagram from {}: {}", addr, reason);
            }
            Err(error) => {
                self.ctx.counters.record_dropped();
                debug!("Dropped datagram from {}: {}", addr, error);
            }
        }
    }

    fn dispatch(
        &mut self,
        datagram: &[u8],
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), DispatchError> {
        if self.ctx.blacklist.is_banned_at(addr, now) {
            return Err(AdmissionError::Banned.into());
        }
        if !self.ctx.limiter.allow_at(addr.ip(), now) {
            return Err(AdmissionError::RateLimited.into());
        }

        let envelope = framing::decode(datagram)?;
        match envelope.packet_type {
            PacketType::Connect => self.on_connect(addr, now),
            PacketType::RetryToken => self.on_retry_token(&envelope, addr, now),
            PacketType::Reliable | PacketType::Unreliable | PacketType::Ack => {
                self.on_link_traffic(&envelope, addr, now)
            }
            PacketType::Disconnect => self.on_disconnect(addr),
            PacketType::Ping => self.on_ping(&envelope, addr),
            PacketType::Pong => self.on_pong(&envelope, addr, now),
            other @ (PacketType::ConnectionAccepted | PacketType::ConnectionDenied) => {
                Err(ProtocolError::UnexpectedPacketType(other).into())
            }
        }
    }

    fn on_connect(&mut self, addr: SocketAddr, now: Instant) -> Result<(), DispatchError> {
        let registry = &self.ctx.registry;
        if registry.is_established(&addr) {
            return Err(ProtocolError::InvalidState(ConnectionState::Connected).into());
        }

        // A repeated Connect from a pending address just gets a fresh token.
        if !registry.is_pending(&addr) {
            match registry.admit_pending(addr, self.ctx.config.connecting_timeout(), now) {
                Ok(_) => {}
                Err(AdmissionError::ServerFull) => {
                    // One denial per source until the hold-off lapses.
                    self.ctx
                        .blacklist
                        .ban_at(addr, self.ctx.config.connecting_timeout(), now);
                    self.send_control(addr, PacketType::ConnectionDenied, &[]);
                    return Err(AdmissionError::ServerFull.into());
                }
                Err(error) => return Err(error.into()),
            }
        }

        let token = self.ctx.tokens.issue(addr)?;
        let body = encode_message(&RetryChallenge { token })?;
        self.send_control(addr, PacketType::RetryToken, &body);
        Ok(())
    }

    fn on_retry_token(
        &mut self,
        envelope: &Envelope<'_>,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), DispatchError> {
        let response = if envelope.payload.len() == RETRY_RESPONSE_SIZE {
            decode_message::<RetryResponse>(envelope.payload).ok()
        } else {
            None
        };

        let cached = self.ctx.registry.established_mut(&addr).map(|connection| {
            response
                .as_ref()
                .and_then(|response| connection.cached_accept(&response.client_public_key))
                .map(<[u8]>::to_vec)
        });
        match cached {
            Some(Some(accepted)) => {
                debug!("Resending ConnectionAccepted to {}", addr);
                self.send(addr, accepted);
                return Ok(());
            }
            Some(None) => {
                return Err(ProtocolError::InvalidState(ConnectionState::Connected).into())
            }
            None => {}
        }

        let (connection_id, state) = match self.ctx.registry.pending_mut(&addr) {
            Some(connection) => (connection.connection_id, connection.state()),
            None => return Err(ProtocolError::UnknownConnection.into()),
        };
        if state != ConnectionState::Connecting {
            return Err(ProtocolError::InvalidState(state).into());
        }

        let tokens = &self.ctx.tokens;
        let response = match response.filter(|response| tokens.validate_token(&response.token, addr)) {
            Some(response) => response,
            None => {
                self.deny(addr, now);
                return Err(AdmissionError::InvalidToken.into());
            }
        };

        let (server_public_key, salt, session) =
            match SecureSession::create_as_server(&response.client_public_key, connection_id) {
                Ok(created) => created,
                Err(error) => {
                    self.deny(addr, now);
                    return Err(error.into());
                }
            };

        let body = encode_message(&ConnectionAccepted {
            connection_id,
            server_public_key,
            salt,
        })?;
        let accepted = framing::encode(
            PacketFlags::NONE,
            PacketType::ConnectionAccepted,
            None,
            &body,
        );
        let link = SecureLink::new(session, self.ctx.config.link_config());

        let established = match self.ctx.registry.pending_mut(&addr) {
            Some(mut connection) => {
                connection.establish(link, response.client_public_key, accepted.clone(), now)
            }
            None => false,
        };
        if !established || !self.ctx.registry.promote(&addr) {
            return Err(ProtocolError::UnknownConnection.into());
        }

        self.send(addr, accepted);
        self.emit(ServerEvent::Connected {
            connection_id,
            addr,
        });
        Ok(())
    }

    /// Refuses a handshake: ban, forget, and one `ConnectionDenied`.
    ///
    /// The ban makes that denial the last thing the source hears from us.
    fn deny(&mut self, addr: SocketAddr, now: Instant) {
        info!("Denied handshake from {}", addr);
        self.ctx
            .blacklist
            .ban_at(addr, self.ctx.config.blacklist_ttl(), now);
        self.ctx.registry.remove(&addr);
        self.send_control(addr, PacketType::ConnectionDenied, &[]);
    }

    fn on_link_traffic(
        &mut self,
        envelope: &Envelope<'_>,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), DispatchError> {
        let (connection_id, result, replies) = {
            let mut connection = self
                .ctx
                .registry
                .established_mut(&addr)
                .ok_or(ProtocolError::UnknownConnection)?;
            let state = connection.state();
            if state != ConnectionState::Connected {
                return Err(ProtocolError::InvalidState(state).into());
            }
            let connection_id = connection.connection_id;
            let link = connection
                .link_mut()
                .ok_or(ProtocolError::InvalidState(state))?;
            let result = link.open(envelope);
            let replies = link.take_outgoing();
            if result.is_ok() {
                connection.touch(now);
            }
            (connection_id, result, replies)
        };

        for datagram in replies {
            self.send(addr, datagram);
        }
        if let Some(received) = result? {
            self.emit(ServerEvent::Data {
                connection_id,
                channel: received.channel,
                payload: received.payload,
            });
        }
        Ok(())
    }

    fn on_disconnect(&mut self, addr: SocketAddr) -> Result<(), DispatchError> {
        if self.close(addr, DisconnectReason::Requested, false) {
            Ok(())
        } else {
            Err(ProtocolError::UnknownConnection.into())
        }
    }

    fn on_ping(&mut self, envelope: &Envelope<'_>, addr: SocketAddr) -> Result<(), DispatchError> {
        if !self.ctx.registry.is_established(&addr) {
            return Err(ProtocolError::UnknownConnection.into());
        }
        let ping: Heartbeat = decode_message(envelope.payload)?;
        let body = encode_message(&ping)?;
        self.send_control(addr, PacketType::Pong, &body);
        Ok(())
    }

    fn on_pong(
        &mut self,
        envelope: &Envelope<'_>,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), DispatchError> {
        let pong: Heartbeat = decode_message(envelope.payload)?;
        let mut connection = self
            .ctx
            .registry
            .established_mut(&addr)
            .ok_or(ProtocolError::UnknownConnection)?;
        if connection.record_pong(pong.timestamp, timestamp_millis(), now) {
            trace!(
                "Connection {} rtt {:?}",
                connection.connection_id,
                connection.ping_rtt
            );
        } else {
            debug!("Connection {} unsolicited pong", connection.connection_id);
        }
        Ok(())
    }

    pub fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Send {
                connection_id,
                channel,
                payload,
            } => {
                if let Err(error) = self.send_to_connection(connection_id, channel, &payload, now) {
                    warn!("Send to connection {} failed: {}", connection_id, error);
                }
            }
            Command::Disconnect { connection_id } => {
                if let Some(addr) = self.ctx.registry.address_of(connection_id) {
                    self.close(addr, DisconnectReason::Kicked, true);
                }
            }
        }
    }

    fn send_to_connection(
        &mut self,
        connection_id: u32,
        channel: Channel,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), DispatchError> {
        let limit = max_payload(self.ctx.config.max_packet_size);
        if payload.len() > limit {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                limit,
            }
            .into());
        }

        let addr = self
            .ctx
            .registry
            .address_of(connection_id)
            .ok_or(ProtocolError::UnknownConnection)?;
        let datagram = {
            let mut connection = self
                .ctx
                .registry
                .established_mut(&addr)
                .ok_or(ProtocolError::UnknownConnection)?;
            let state = connection.state();
            let link = connection
                .link_mut()
                .ok_or(ProtocolError::InvalidState(state))?;
            match channel {
                Channel::Reliable => link.send_reliable(payload, now)?,
                Channel::Unreliable => link.send_unreliable(payload)?,
            }
        };
        self.send(addr, datagram);
        Ok(())
    }

    /// Periodic work: retransmissions and rekey proposals, heartbeats,
    /// timeouts and table sweeps.
    pub fn on_tick(&mut self, now: Instant) {
        let config = &self.ctx.config;
        let heartbeat_due =
            now.saturating_duration_since(self.last_heartbeat) >= config.heartbeat_interval();
        let stamp = timestamp_millis();
        let ping = if heartbeat_due {
            self.last_heartbeat = now;
            encode_message(&Heartbeat { timestamp: stamp }).ok()
        } else {
            None
        };

        for addr in self.ctx.registry.established_addrs() {
            let (result, outgoing) = {
                let mut connection = match self.ctx.registry.established_mut(&addr) {
                    Some(connection) => connection,
                    None => continue,
                };
                if ping.is_some() {
                    connection.record_ping(stamp);
                }
                let connection_id = connection.connection_id;
                match connection.link_mut() {
                    Some(link) => {
                        let result = link.poll(now).map_err(|error| (connection_id, error));
                        (result, link.take_outgoing())
                    }
                    None => continue,
                }
            };
            if let Err((connection_id, error)) = result {
                warn!("Connection {} link poll failed: {}", connection_id, error);
            }
            for datagram in outgoing {
                self.send(addr, datagram);
            }
            if let Some(body) = &ping {
                self.send_control(addr, PacketType::Ping, body);
            }
        }

        let timeout = self.ctx.config.heartbeat_timeout();
        for addr in self.ctx.registry.timed_out(now, timeout) {
            self.close(addr, DisconnectReason::TimedOut, true);
        }
        for addr in self.ctx.registry.expired_pending(now) {
            self.close(addr, DisconnectReason::TimedOut, false);
        }

        if now.saturating_duration_since(self.last_sweep) >= self.ctx.config.sweep_interval() {
            self.last_sweep = now;
            let bans = self.ctx.blacklist.sweep_at(DEFAULT_SWEEP_BUDGET, now);
            let buckets = self.ctx.limiter.sweep_idle(LIMITER_IDLE, now);
            let counters = self.ctx.counters.snapshot();
            debug!(
                "Swept {} bans and {} buckets; {} pending, {} established; rx {} pkts/{} bytes, tx {} pkts/{} bytes, {} dropped",
                bans,
                buckets,
                self.ctx.registry.pending_len(),
                self.ctx.registry.established_len(),
                counters.packets_received,
                counters.bytes_received,
                counters.packets_sent,
                counters.bytes_sent,
                counters.packets_dropped
            );
        }
    }

    /// Closes every established connection, telling each client.
    pub fn shutdown(&mut self) {
        for addr in self.ctx.registry.established_addrs() {
            self.close(addr, DisconnectReason::Shutdown, true);
        }
    }

    /// Removes the connection at `addr`, optionally sending it `Disconnect`.
    ///
    /// Only connections that were reported as connected produce a
    /// `Disconnected` event.
    fn close(&mut self, addr: SocketAddr, reason: DisconnectReason, notify: bool) -> bool {
        let mut connection = match self.ctx.registry.remove(&addr) {
            Some(connection) => connection,
            None => return false,
        };
        let was_connected = connection.state() == ConnectionState::Connected;
        connection.begin_disconnect();
        connection.finish_disconnect();

        if notify {
            self.send_control(addr, PacketType::Disconnect, &[]);
        }
        if was_connected {
            info!(
                "Connection {} from {} closed: {:?}",
                connection.connection_id, addr, reason
            );
            self.emit(ServerEvent::Disconnected {
                connection_id: connection.connection_id,
                reason,
            });
        } else {
            debug!(
                "Pending connection {} from {} dropped: {:?}",
                connection.connection_id, addr, reason
            );
        }
        true
    }

    fn send(&self, addr: SocketAddr, buffer: Vec<u8>) {
        if self.outgoing.send(Outgoing { buffer, addr }).is_err() {
            debug!("Send queue closed, dropping datagram for {}", addr);
        }
    }

    /// Frames a plaintext control packet into a pooled buffer.
    fn send_control(&self, addr: SocketAddr, packet_type: PacketType, payload: &[u8]) {
        let mut buffer = self.ctx.pool.acquire();
        framing::encode_into(&mut buffer, PacketFlags::NONE, packet_type, None, payload);
        self.send(addr, buffer);
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            trace!("No listener for server events");
        }
    }
}
