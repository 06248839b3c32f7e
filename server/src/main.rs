use clap::Parser;
use log::info;
use server::credentials::{CredentialStore, JsonFileStore, MemoryStore};
use server::{load_or_create_key, Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind both sockets to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Stream (TCP) port
    #[clap(short, long, default_value = "1942")]
    port: u16,
    /// Datagram (UDP) port, defaults to the stream port plus one
    #[clap(short, long)]
    udp_port: Option<u16>,
    /// Number of player slots
    #[clap(short, long, default_value = "16")]
    max_players: u8,
    /// Position broadcasts per second
    #[clap(short, long, default_value = "100")]
    tick_rate: u32,
    /// File holding the 32-byte default key, created if missing
    #[clap(short, long, default_value = "encryption_key.txt")]
    key_file: PathBuf,
    /// JSON file for player accounts; accounts live in memory when omitted
    #[clap(short, long)]
    database: Option<PathBuf>,
    /// Size of the server's RSA key
    #[clap(long, default_value = "2048")]
    rsa_bits: usize,
    /// Unanswered pings before a session is dropped, 0 disables
    #[clap(long, default_value = "4")]
    ping_timeout: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        udp_port: args.udp_port,
        max_players: args.max_players,
        tick_rate: args.tick_rate,
        rsa_bits: args.rsa_bits,
        ping_timeout: args.ping_timeout,
        default_key: load_or_create_key(&args.key_file)?,
        ..Default::default()
    };

    let store: Arc<dyn CredentialStore> = match &args.database {
        Some(path) => {
            let store = JsonFileStore::open(path)?;
            info!("Player accounts are kept in {}", store.path().display());
            Arc::new(store)
        }
        None => {
            info!("No database given, player accounts are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let server = Server::bind(config, store).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
