use clap::Parser;
use client::network::{Bot, ClientError, Credentials};
use log::{error, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:43594")]
    server: String,

    /// Number of bots to connect
    #[arg(short = 'n', long, default_value = "1")]
    bots: usize,

    /// Milliseconds between walk requests
    #[arg(short = 'w', long, default_value = "1800")]
    walk_ms: u64,

    /// Largest distance of a single random walk
    #[arg(short = 'r', long, default_value = "6")]
    range: i32,

    /// Prefix for bot usernames
    #[arg(long, default_value = "bot")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting {} bots to {}", args.bots, args.server);

    let mut handles = Vec::with_capacity(args.bots);
    for index in 0..args.bots {
        let server = args.server.clone();
        let username = format!("{}{}", args.prefix, index);
        let walk_every = Duration::from_millis(args.walk_ms.max(1));
        let range = args.range.max(1);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_bot(&server, username.clone(), walk_every, range).await {
                error!("{} stopped: {}", username, e);
            }
        }));
    }

    tokio::select! {
        _ = wait_all(handles) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
    Ok(())
}

async fn wait_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Bot task panicked: {}", e);
        }
    }
}

async fn run_bot(
    server: &str,
    username: String,
    walk_every: Duration,
    range: i32,
) -> Result<(), ClientError> {
    let stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;
    let mut bot = Bot::login(stream, &Credentials::new(username, "password")).await?;

    let mut walk_timer = interval(walk_every);
    walk_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ping_timer = interval(Duration::from_secs(5));
    let mut seen = 0;

    loop {
        tokio::select! {
            frame = bot.next_frame() => {
                frame?;
                let active = bot.view.active().len();
                if active != seen {
                    seen = active;
                    info!("{} sees {} players at {:?}", bot.username, active, bot.view.position());
                }
            }
            _ = walk_timer.tick() => {
                if let Some((x, y, _)) = bot.view.position() {
                    let (dx, dy) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(-range..=range), rng.gen_range(-range..=range))
                    };
                    bot.walk(&[(x, y), (x + dx, y + dy)], false).await?;
                }
            }
            _ = ping_timer.tick() => bot.ping().await?,
        }
    }
}
