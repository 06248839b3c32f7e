use clap::Parser;
use client::{ClientConfig, Connection};
use log::{debug, info};
use rand::Rng;
use shared::{Position, SessionKey};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless bot that logs in and wanders around")]
struct Args {
    /// Server stream address
    #[arg(short, long, default_value = "127.0.0.1:1942")]
    server: SocketAddr,

    /// Server datagram port, defaults to the stream port plus one
    #[arg(short, long)]
    udp_port: Option<u16>,

    /// File holding the 32-byte default key; the built-in key is used when omitted
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    #[arg(short, long, default_value = "bot")]
    name: String,

    #[arg(short, long, default_value = "password")]
    password: String,

    /// Register the name before logging in
    #[arg(short, long)]
    register: bool,

    /// Position updates per second
    #[arg(long, default_value = "20")]
    rate: u32,

    /// Seconds to stay connected, 0 runs until Ctrl+C
    #[arg(short, long, default_value = "0")]
    duration: u64,

    #[arg(long, default_value = "2048")]
    rsa_bits: usize,
}

fn read_key(path: &PathBuf) -> Result<SessionKey, Box<dyn std::error::Error>> {
    let contents = std::fs::read(path)?;
    let trimmed = contents
        .strip_suffix(b"\r\n")
        .or_else(|| contents.strip_suffix(b"\n"))
        .unwrap_or(&contents);
    Ok(SessionKey::from_bytes(trimmed)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ClientConfig {
        rsa_bits: args.rsa_bits,
        ..ClientConfig::new(args.server)
    };
    if let Some(port) = args.udp_port {
        config.udp_addr = Some(SocketAddr::new(args.server.ip(), port));
    }
    if let Some(path) = &args.key_file {
        config.default_key = read_key(path)?;
    }

    info!("Connecting to {}", args.server);
    let connection = Connection::connect(config).await?;
    let mut client = connection.login(&args.name, &args.password, args.register).await?;
    info!(
        "Joined as {} in slot {} of {}, server ticks at {} Hz",
        args.name,
        client.slot(),
        client.max_players(),
        client.tick_rate()
    );

    let mut rng = rand::thread_rng();
    let mut position = Position::default();
    let mut timer = interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));

    loop {
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            info!("Run time elapsed");
            break;
        }
        if !client.is_connected() {
            info!("Disconnected by the server");
            return Ok(());
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, logging out");
                break;
            }
            _ = timer.tick() => {
                position.x += rng.gen_range(-1.0..=1.0);
                position.y += rng.gen_range(-1.0..=1.0);
                client.send_position(position).await?;

                if let Some(list) = client.latest_player_list() {
                    let online: Vec<&String> = list.players.iter().flatten().collect();
                    info!("Players online: {:?}", online);
                }
            }
            snapshot = client.recv_snapshot(Duration::from_secs(1)) => match snapshot {
                Ok(snapshot) => debug!(
                    "Snapshot {}: {} players placed",
                    snapshot.tick,
                    snapshot.positions.iter().flatten().count()
                ),
                Err(e) => debug!("No snapshot: {}", e),
            },
        }
    }

    client.logout().await?;
    Ok(())
}
