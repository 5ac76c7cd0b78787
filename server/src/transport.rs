//! Server network layer: socket setup and the three transport tasks.
//!
//! ```text
//!  socket ──recv_from──▶ receive task ──Inbound──▶ process loop ──Outgoing──▶ send task ──send_to──▶ socket
//!                                                    ▲      │
//!                                 ServerHandle ──Command┘      └──ServerEvent──▶ application
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use shared::Channel;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::context::TransportContext;
use crate::dispatch::{Command, Dispatcher, Inbound, Outgoing, ServerEvent};
use crate::error::ServerError;

/// Cloneable handle the application uses to talk to a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    ctx: Arc<TransportContext>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Queues `payload` for a connection. Returns false once the server has stopped.
    pub fn send(&self, connection_id: u32, channel: Channel, payload: Vec<u8>) -> bool {
        self.commands
            .send(Command::Send {
                connection_id,
                channel,
                payload,
            })
            .is_ok()
    }

    pub fn disconnect(&self, connection_id: u32) -> bool {
        self.commands
            .send(Command::Disconnect { connection_id })
            .is_ok()
    }

    /// Established connections right now.
    pub fn connection_count(&self) -> usize {
        self.ctx.registry.established_len()
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks every task to stop. `Server::run` returns shortly after.
    pub fn shutdown(&self) {
        self.ctx.stop();
        let _ = self.shutdown.send(true);
    }
}

/// Main server coordinating the receive task, process loop and send task
pub struct Server {
    socket: Arc<UdpSocket>,
    ctx: Arc<TransportContext>,
    local_addr: SocketAddr,

    // Communication channels
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Validates `config` and binds the socket. Must be called inside a tokio runtime.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = resolve(&config.bind_address())?;
        let std_socket = build_socket(addr, &config)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Server {
            socket: Arc::new(socket),
            ctx: Arc::new(TransportContext::new(config)),
            local_addr,
            command_tx,
            command_rx,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            ctx: Arc::clone(&self.ctx),
            commands: self.command_tx.clone(),
            shutdown: Arc::clone(&self.shutdown_tx),
            local_addr: self.local_addr,
        }
    }

    /// Takes the application event stream. Only the first call gets it.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Spawns task that continuously reads datagrams into pooled buffers
    fn spawn_receiver(&self, inbound_tx: mpsc::UnboundedSender<Inbound>) {
        let socket = Arc::clone(&self.socket);
        let ctx = Arc::clone(&self.ctx);
        let mut shutdown = self.shutdown_rx.clone();
        let size = ctx.config.max_packet_size;

        tokio::spawn(async move {
            while ctx.is_running() {
                let mut buffer = ctx.pool.acquire();
                buffer.resize(size, 0);

                let received = tokio::select! {
                    result = socket.recv_from(&mut buffer) => result,
                    _ = shutdown.changed() => break,
                };

                match received {
                    Ok((len, addr)) => {
                        ctx.counters.record_received(len);
                        buffer.truncate(len);
                        if inbound_tx.send(Inbound { buffer, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Transient on UDP (WouldBlock, ICMP-induced resets); retry.
                        debug!("Receive error: {}", e);
                        ctx.pool.release(buffer);
                    }
                }
            }
            debug!("Receive task stopped");
        });
    }

    /// Spawns task that drains the outgoing queue in batches
    fn spawn_sender(&self, mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let ctx = Arc::clone(&self.ctx);
        let batch_size = ctx.config.send_batch_size;

        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(batch_size);
            while let Some(first) = outgoing_rx.recv().await {
                batch.push(first);
                while batch.len() < batch_size {
                    match outgoing_rx.try_recv() {
                        Ok(next) => batch.push(next),
                        Err(_) => break,
                    }
                }

                for Outgoing { buffer, addr } in batch.drain(..) {
                    match socket.send_to(&buffer, addr).await {
                        Ok(sent) => ctx.counters.record_sent(sent),
                        Err(e) => warn!("Failed to send to {}: {}", addr, e),
                    }
                    ctx.pool.release(buffer);
                }
            }
            debug!("Send task stopped");
        })
    }

    /// Main server loop: runs until `ServerHandle::shutdown` is called
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.spawn_receiver(inbound_tx);
        let sender = self.spawn_sender(outgoing_rx);

        let mut dispatcher =
            Dispatcher::new(Arc::clone(&self.ctx), outgoing_tx, self.event_tx.clone());
        let mut tick = interval(self.ctx.config.tick_duration());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_rx.clone();

        info!("Server started successfully");

        while self.ctx.is_running() {
            tokio::select! {
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(Inbound { buffer, addr }) => {
                            dispatcher.handle_datagram(&buffer, addr, Instant::now());
                            self.ctx.pool.release(buffer);
                        }
                        None => {
                            error!("Receive task exited unexpectedly");
                            break;
                        }
                    }
                },

                Some(command) = self.command_rx.recv() => {
                    dispatcher.handle_command(command, Instant::now());
                },

                _ = tick.tick() => {
                    dispatcher.on_tick(Instant::now());
                },

                _ = shutdown.changed() => break,
            }
        }

        info!("Server shutting down");
        dispatcher.shutdown();
        self.ctx.stop();
        let _ = self.shutdown_tx.send(true);

        // Closing the queue lets the send task flush the final Disconnects and exit.
        drop(dispatcher);
        if let Err(e) = sender.await {
            error!("Send task failed: {}", e);
        }
        Ok(())
    }
}

fn resolve(address: &str) -> Result<SocketAddr, ServerError> {
    address
        .to_socket_addrs()
        .map_err(|_| ServerError::Address(address.to_string()))?
        .next()
        .ok_or_else(|| ServerError::Address(address.to_string()))
}

/// Creates the UDP socket with kernel buffers sized before tokio takes it over.
fn build_socket(addr: SocketAddr, config: &ServerConfig) -> Result<std::net::UdpSocket, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ServerError::bind(addr, e))?;

    // The kernel may clamp or refuse these; a smaller buffer is not fatal.
    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
        warn!("Could not set receive buffer to {}: {}", config.recv_buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
        warn!("Could not set send buffer to {}: {}", config.send_buffer_size, e);
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::bind(addr, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::bind(addr, e))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::framing::{self, PacketType};
    use std::time::Duration;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(resolve("not an address"), Err(ServerError::Address(_))));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind(loopback_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.handle().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let mut config = loopback_config();
        config.tick_rate = 0;
        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = Server::bind(loopback_config()).await.unwrap();
        let mut config = loopback_config();
        config.port = first.local_addr().port();
        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let mut server = Server::bind(loopback_config()).await.unwrap();
        assert!(server.events().is_some());
        assert!(server.events().is_none());
    }

    #[tokio::test]
    async fn test_connect_answered_over_socket() {
        let mut server = Server::bind(loopback_config()).await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move { server.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&framing::encode_bare(PacketType::Connect), handle.local_addr())
            .await
            .unwrap();

        let mut buffer = [0u8; 1500];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let envelope = framing::decode(&buffer[..len]).unwrap();
        assert_eq!(envelope.packet_type, PacketType::RetryToken);

        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert!(handle.context().counters.snapshot().packets_received >= 1);
    }
}
