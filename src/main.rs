use anyhow::Result;
use clap::Parser;
use riptide::Server;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// io_uring-native HTTP/1.x static file server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on.
    port: u16,

    /// Number of worker threads. Defaults to one per CPU.
    #[arg(long)]
    workers: Option<usize>,

    /// Directory request paths resolve under.
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riptide=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);

    let mut server = Server::bind(addr)?.document_root(args.root);
    if let Some(workers) = args.workers {
        server = server.workers(workers);
    }

    server.serve()
}
