//! Client network layer: handshake, sealed traffic and heartbeat replies.
//!
//! The client is poll-driven. Nothing happens in the background: acks,
//! pongs, rekey answers and retransmissions go out while the caller is
//! inside [`Client::poll`].

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use shared::framing::{self, PacketFlags, PacketType};
use shared::link::max_payload;
use shared::messages::{
    decode_message, encode_message, ConnectionAccepted, Heartbeat, RetryChallenge, RetryResponse,
};
use shared::session::generate_keypair;
use shared::{
    timestamp_millis, AntiSpoofToken, Channel, ConnectionState, LinkConfig, Received, SecureLink,
    SecureSession,
};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use crate::error::ClientError;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server; resolved once in [`Client::bind`].
    pub server_address: String,
    /// Total time allowed from the first `Connect` to `ConnectionAccepted`.
    pub handshake_timeout: Duration,
    /// How long to wait for a handshake reply before resending.
    pub retry_interval: Duration,
    pub max_packet_size: usize,
    /// Retransmission and rekey thresholds for the established link.
    pub link: LinkConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: format!("127.0.0.1:{}", shared::DEFAULT_PORT),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_packet_size: shared::MAX_PACKET_SIZE,
            link: LinkConfig::default(),
        }
    }
}

/// Something the application should see, returned from [`Client::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Data { channel: Channel, payload: Vec<u8> },
    /// The server closed the connection.
    Disconnected,
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    config: ClientConfig,

    state: ConnectionState,
    connection_id: Option<u32>,
    link: Option<SecureLink>,

    last_ping: Option<u64>,
    ping_rtt: Option<Duration>,
    last_activity: Instant,

    outbox: Vec<Vec<u8>>,
    buffer: Vec<u8>,
}

impl Client {
    /// Resolves the server address and binds an ephemeral local socket to it.
    pub async fn bind(config: ClientConfig) -> Result<Self, ClientError> {
        let server_addr = lookup_host(config.server_address.as_str())
            .await
            .map_err(|_| ClientError::Address(config.server_address.clone()))?
            .next()
            .ok_or_else(|| ClientError::Address(config.server_address.clone()))?;

        let local = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server_addr).await?;
        debug!("Client bound to {}", socket.local_addr()?);

        Ok(Client {
            socket,
            server_addr,
            buffer: vec![0u8; config.max_packet_size.max(shared::MAX_PACKET_SIZE)],
            config,
            state: ConnectionState::Disconnected,
            connection_id: None,
            link: None,
            last_ping: None,
            ping_rtt: None,
            last_activity: Instant::now(),
            outbox: Vec::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.connection_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Round trip of the last answered [`Client::ping`].
    pub fn ping_rtt(&self) -> Option<Duration> {
        self.ping_rtt
    }

    /// Time since the server last sent something that authenticated.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn rekeys_completed(&self) -> u64 {
        self.link.as_ref().map_or(0, SecureLink::rekeys_completed)
    }

    /// Runs the Connect → RetryToken → ConnectionAccepted handshake.
    ///
    /// Requests are resent every `retry_interval` until the server answers
    /// or `handshake_timeout` runs out. A `ConnectionDenied` ends the attempt
    /// immediately. Returns the connection id the server assigned.
    pub async fn connect(&mut self) -> Result<u32, ClientError> {
        if let (ConnectionState::Connected, Some(id)) = (self.state, self.connection_id) {
            return Ok(id);
        }

        info!("Connecting to {}...", self.server_addr);
        self.state = ConnectionState::Connecting;
        let result = self.handshake().await;
        if result.is_err() {
            self.reset();
        }
        result
    }

    async fn handshake(&mut self) -> Result<u32, ClientError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let (private_key, public_key) = generate_keypair();
        let mut token: Option<AntiSpoofToken> = None;

        while Instant::now() < deadline {
            let request = match token {
                None => framing::encode_bare(PacketType::Connect),
                Some(token) => {
                    let body = encode_message(&RetryResponse {
                        client_public_key: public_key,
                        token,
                    })?;
                    framing::encode(PacketFlags::NONE, PacketType::RetryToken, None, &body)
                }
            };
            self.send_datagram(&request).await?;

            let resend_at = (Instant::now() + self.config.retry_interval).min(deadline);
            while let Some(datagram) = self.recv_until(resend_at).await? {
                let envelope = match framing::decode(&datagram) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!("Dropped handshake datagram: {}", e);
                        continue;
                    }
                };

                match envelope.packet_type {
                    PacketType::RetryToken => {
                        match decode_message::<RetryChallenge>(envelope.payload) {
                            Ok(challenge) => {
                                trace!("Received retry token");
                                token = Some(challenge.token);
                                // Answer right away instead of waiting out the interval.
                                break;
                            }
                            Err(e) => debug!("Dropped retry challenge: {}", e),
                        }
                    }
                    PacketType::ConnectionAccepted if token.is_some() => {
                        let accepted: ConnectionAccepted = match decode_message(envelope.payload) {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                debug!("Dropped connection accept: {}", e);
                                continue;
                            }
                        };
                        let session = SecureSession::create_as_client(
                            &private_key,
                            &accepted.server_public_key,
                            &accepted.salt,
                            accepted.connection_id,
                        )?;

                        self.link = Some(SecureLink::new(session, self.config.link));
                        self.connection_id = Some(accepted.connection_id);
                        self.state = ConnectionState::Connected;
                        self.last_activity = Instant::now();
                        info!("Connected! Connection ID: {}", accepted.connection_id);
                        return Ok(accepted.connection_id);
                    }
                    PacketType::ConnectionDenied => {
                        warn!("Connection denied by {}", self.server_addr);
                        return Err(ClientError::Denied);
                    }
                    other => trace!("Ignoring {:?} during handshake", other),
                }
            }
        }

        warn!("Handshake with {} timed out", self.server_addr);
        Err(ClientError::Timeout)
    }

    pub async fn send_unreliable(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.check_size(payload.len())?;
        let link = self.link.as_mut().ok_or(ClientError::NotConnected)?;
        let datagram = link.send_unreliable(payload)?;
        self.send_datagram(&datagram).await
    }

    /// Sends `payload` and keeps retransmitting it from [`Client::poll`] until acked.
    pub async fn send_reliable(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.check_size(payload.len())?;
        let link = self.link.as_mut().ok_or(ClientError::NotConnected)?;
        let datagram = link.send_reliable(payload, Instant::now())?;
        self.send_datagram(&datagram).await
    }

    pub async fn send(&mut self, channel: Channel, payload: &[u8]) -> Result<(), ClientError> {
        match channel {
            Channel::Unreliable => self.send_unreliable(payload).await,
            Channel::Reliable => self.send_reliable(payload).await,
        }
    }

    /// Sends a plaintext `Ping`; the RTT is recorded when the matching `Pong` arrives.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        if self.link.is_none() {
            return Err(ClientError::NotConnected);
        }
        let timestamp = timestamp_millis();
        let body = encode_message(&Heartbeat { timestamp })?;
        self.last_ping = Some(timestamp);
        self.send_datagram(&framing::encode(
            PacketFlags::NONE,
            PacketType::Ping,
            None,
            &body,
        ))
        .await
    }

    /// Proposes a key rotation now instead of waiting for the byte or age threshold.
    pub async fn request_rekey(&mut self) -> Result<(), ClientError> {
        let link = self.link.as_mut().ok_or(ClientError::NotConnected)?;
        link.request_rekey(Instant::now())?;
        self.outbox.extend(link.take_outgoing());
        self.flush().await
    }

    /// Processes incoming datagrams for up to `wait`.
    ///
    /// Returns as soon as there is an event for the application, or `None`
    /// once `wait` has elapsed. Retransmissions and rekey proposals are sent
    /// along the way.
    pub async fn poll(&mut self, wait: Duration) -> Result<Option<ClientEvent>, ClientError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            let link = self.link.as_mut().ok_or(ClientError::NotConnected)?;
            link.poll(now)?;
            self.outbox.extend(link.take_outgoing());
            self.flush().await?;

            if now >= deadline {
                return Ok(None);
            }
            let step = (deadline - now).min(self.config.link.resend_interval);
            let Some(datagram) = self.recv_until(now + step).await? else {
                continue;
            };

            let event = self.handle_datagram(&datagram, Instant::now())?;
            self.flush().await?;
            if event.is_some() {
                return Ok(event);
            }
        }
    }

    /// Tells the server we are leaving. Safe to call when not connected.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.link.is_none() {
            return Ok(());
        }
        self.state = ConnectionState::Disconnecting;
        let result = self
            .send_datagram(&framing::encode_bare(PacketType::Disconnect))
            .await;
        info!("Disconnected from {}", self.server_addr);
        self.reset();
        result
    }

    fn handle_datagram(
        &mut self,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Option<ClientEvent>, ClientError> {
        let envelope = match framing::decode(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropped datagram: {}", e);
                return Ok(None);
            }
        };

        match envelope.packet_type {
            PacketType::Unreliable | PacketType::Reliable | PacketType::Ack => {
                let Some(link) = self.link.as_mut() else {
                    return Ok(None);
                };
                match link.open(&envelope) {
                    Ok(received) => {
                        self.outbox.extend(link.take_outgoing());
                        self.last_activity = now;
                        Ok(received
                            .map(|Received { channel, payload }| ClientEvent::Data { channel, payload }))
                    }
                    Err(e) => {
                        debug!("Dropped sealed datagram: {}", e);
                        Ok(None)
                    }
                }
            }
            PacketType::Ping => {
                let ping: Heartbeat = match decode_message(envelope.payload) {
                    Ok(ping) => ping,
                    Err(e) => {
                        debug!("Dropped ping: {}", e);
                        return Ok(None);
                    }
                };
                let body = encode_message(&ping)?;
                self.outbox.push(framing::encode(
                    PacketFlags::NONE,
                    PacketType::Pong,
                    None,
                    &body,
                ));
                Ok(None)
            }
            PacketType::Pong => {
                if let Ok(pong) = decode_message::<Heartbeat>(envelope.payload) {
                    if self.last_ping == Some(pong.timestamp) {
                        self.last_ping = None;
                        let rtt = timestamp_millis().saturating_sub(pong.timestamp);
                        self.ping_rtt = Some(Duration::from_millis(rtt));
                        trace!("Ping RTT {}ms", rtt);
                    }
                }
                Ok(None)
            }
            PacketType::Disconnect if self.link.is_some() => {
                info!("Server closed connection {:?}", self.connection_id);
                self.reset();
                Ok(Some(ClientEvent::Disconnected))
            }
            other => {
                trace!("Ignoring {:?}", other);
                Ok(None)
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ClientError> {
        let limit = max_payload(self.config.max_packet_size);
        if size > limit {
            return Err(ClientError::PayloadTooLarge { size, limit });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.connection_id = None;
        self.link = None;
        self.last_ping = None;
        self.outbox.clear();
    }

    async fn flush(&mut self) -> Result<(), ClientError> {
        for datagram in std::mem::take(&mut self.outbox) {
            self.send_datagram(&datagram).await?;
        }
        Ok(())
    }

    async fn send_datagram(&self, datagram: &[u8]) -> Result<(), ClientError> {
        match self.socket.send(datagram).await {
            Ok(_) => Ok(()),
            // ICMP port unreachable from an earlier send; the server may not be up yet.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("Send to {} refused: {}", self.server_addr, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for one datagram from the server, or `None` at `deadline`.
    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, ClientError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match timeout(remaining, self.socket.recv(&mut self.buffer)).await {
                Err(_) => return Ok(None),
                Ok(Ok(len)) => return Ok(Some(self.buffer[..len].to_vec())),
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!("Server {} unreachable: {}", self.server_addr, e);
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}
