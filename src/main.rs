mod uring;

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use ioarena::config::DEFAULT_COMPLETION_WORKERS;
use ioarena::{Echo, Server, ServerConfig, metrics};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use uring::UringTransport;

#[derive(Parser)]
#[command(about = "Pre-allocated io_uring TCP echo server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    /// Maximum simultaneously admitted connections
    #[arg(long, default_value_t = 1000)]
    max_connections: u32,

    /// Bytes per read/write chunk
    #[arg(long, default_value_t = 1024)]
    chunk_size: u32,

    /// Listen backlog
    #[arg(long, default_value_t = 100)]
    backlog: u32,

    /// Completion dispatch threads
    #[arg(long, default_value_t = DEFAULT_COMPLETION_WORKERS)]
    workers: usize,

    /// io_uring submission queue entries
    #[arg(long, default_value_t = 4096)]
    ring_entries: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ioarena failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> ioarena::Result<()> {
    let config = ServerConfig {
        max_connections: args.max_connections,
        chunk_size: args.chunk_size,
        listen_backlog: args.backlog,
        completion_workers: args.workers.max(1),
        ..ServerConfig::default()
    };

    let transport = UringTransport::new(args.ring_entries)?;
    let mut server = Server::init(config, transport, Echo)?;
    metrics::spawn_reporter();

    let addr = server.start(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)))?;
    info!(
        %addr,
        arena_mb = server.config().arena_pool_size() / 1_000_000,
        "ioarena: ready"
    );

    loop {
        thread::park();
    }
}
