use std::time::{Duration, Instant};

use clap::Parser;
use client::{Client, ClientConfig, ClientEvent};
use log::{info, warn};
use shared::Channel;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Number of payloads to send
    #[arg(short = 'n', long, default_value = "10")]
    count: u32,

    /// Delay between payloads in milliseconds
    #[arg(short = 'i', long, default_value = "100")]
    interval: u64,

    /// Send on the reliable channel
    #[arg(short = 'r', long)]
    reliable: bool,

    /// Handshake timeout in milliseconds
    #[arg(long, default_value = "5000")]
    handshake_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        server_address: args.server.clone(),
        handshake_timeout: Duration::from_millis(args.handshake_timeout),
        ..ClientConfig::default()
    };
    let channel = if args.reliable {
        Channel::Reliable
    } else {
        Channel::Unreliable
    };

    info!("Connecting to: {}", args.server);
    let mut client = Client::bind(config).await?;
    let started = Instant::now();
    let connection_id = client.connect().await?;
    info!(
        "Handshake completed in {:?} (connection {})",
        started.elapsed(),
        connection_id
    );

    let mut echoed = 0u32;
    for i in 0..args.count {
        let payload = format!("message {}", i);
        client.send(channel, payload.as_bytes()).await?;
        client.ping().await?;

        match client.poll(Duration::from_millis(args.interval)).await? {
            Some(ClientEvent::Data { payload, .. }) => {
                echoed += 1;
                info!("Echo: {}", String::from_utf8_lossy(&payload));
            }
            Some(ClientEvent::Disconnected) => {
                warn!("Server closed the connection");
                return Ok(());
            }
            None => {}
        }
    }

    // Give late echoes and retransmissions a moment to land.
    while let Some(event) = client.poll(Duration::from_millis(args.interval)).await? {
        match event {
            ClientEvent::Data { .. } => echoed += 1,
            ClientEvent::Disconnected => break,
        }
    }

    info!(
        "{}/{} payloads echoed, ping {:?}",
        echoed,
        args.count,
        client.ping_rtt()
    );
    client.disconnect().await?;

    Ok(())
}
