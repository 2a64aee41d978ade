use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use redkv::codec::DEFAULT_MAX_FRAME_SIZE;
use redkv::config::DEFAULT_PORT;
use redkv::{Config, Error, Server, Shutdown};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The address to listen on
    #[arg(long, env = "REDKV_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// The port to listen on
    #[arg(short, long, env = "REDKV_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connections beyond this many are closed right after they are accepted
    #[arg(long, env = "REDKV_MAX_CONNECTIONS", default_value_t = 100)]
    max_connections: usize,

    /// How long to wait for connections to finish on shutdown before closing them
    #[arg(long, env = "REDKV_SHUTDOWN_TIMEOUT_MS", default_value_t = 5000)]
    shutdown_timeout_ms: u64,

    /// Deadline for writing a single response
    #[arg(long, env = "REDKV_WRITE_TIMEOUT_MS", default_value_t = 5000)]
    write_timeout_ms: u64,

    /// Largest request the server buffers, in bytes
    #[arg(long, env = "MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            addr: SocketAddr::new(args.host, args.port),
            max_connections: args.max_connections,
            shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            max_frame_size: args.max_frame_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let server = Server::bind(Config::from(args)).await?;
    server.run()?;

    shutdown_signal().await?;
    info!("Shutdown signal received");

    match server.kill().await {
        Shutdown::Graceful => info!("Server stopped"),
        Shutdown::Forced { connections } => {
            warn!("Server stopped, {} connections were closed forcibly", connections)
        }
        Shutdown::AlreadyStopped => info!("Server was already stopped"),
    }

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
