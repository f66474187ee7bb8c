use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use server::world::World;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server IP address to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Offset added to the base port 43594
    #[arg(short, long)]
    port_offset: Option<u16>,

    /// Tick duration in milliseconds
    #[arg(short, long)]
    tick_ms: Option<u64>,

    /// Maximum number of connected clients
    #[arg(short, long)]
    max_clients: Option<usize>,

    /// Region table file
    #[arg(long)]
    regions: Option<PathBuf>,

    /// Music table file
    #[arg(long)]
    music: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, server::config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(offset) = self.port_offset {
            config.port_offset = offset;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.tick_ms = tick_ms;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if self.regions.is_some() {
            config.regions = self.regions;
        }
        if self.music.is_some() {
            config.music = self.music;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config()?;
    info!(
        "Starting server on {} with {}ms ticks and room for {} clients",
        config.bind_addr(),
        config.tick_ms,
        config.client_capacity()
    );

    let addr = config.bind_addr();
    let world = World::from_config(config)?;
    let server = Server::bind(&addr, world).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
