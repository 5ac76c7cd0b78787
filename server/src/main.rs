use clap::Parser;
use log::{error, info};
use server::{Server, ServerConfig, ServerEvent};

/// Main-method of the application.
/// Parses command-line arguments, binds the transport and echoes every
/// payload back to the connection that sent it.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// JSON configuration file; flags below override its values
        #[clap(short, long)]
        config: Option<String>,
        /// Server IP address to bind to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Server port to listen on
        #[clap(short, long)]
        port: Option<u16>,
        /// Tick rate (process loop ticks per second)
        #[clap(short, long)]
        tick_rate: Option<u32>,
        /// Maximum concurrent connections
        #[clap(short, long)]
        max_connections: Option<usize>,
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(tick_rate) = args.tick_rate {
        config.tick_rate = tick_rate;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }

    let mut server = Server::bind(config).await?;
    let handle = server.handle();
    let mut events = server.events().ok_or("event stream already taken")?;

    // Echo application: everything a client sends comes straight back.
    let echo = {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ServerEvent::Connected {
                        connection_id,
                        addr,
                    } => info!("Client {} connected from {}", connection_id, addr),
                    ServerEvent::Data {
                        connection_id,
                        channel,
                        payload,
                    } => {
                        handle.send(connection_id, channel, payload);
                    }
                    ServerEvent::Disconnected {
                        connection_id,
                        reason,
                    } => info!("Client {} disconnected: {:?}", connection_id, reason),
                }
            }
        })
    };

    let mut server_task = tokio::spawn(async move { server.run().await });

    // Handle shutdown gracefully
    let result = tokio::select! {
        result = &mut server_task => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
            server_task.await
        }
    };
    match result {
        Ok(Err(e)) => error!("Server stopped with error: {}", e),
        Err(e) => error!("Server task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    echo.abort();
    Ok(())
}
