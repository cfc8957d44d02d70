use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use rdma_echo::{provider::verbs::VerbsProvider, EchoConfig, EchoServer};
use tracing_subscriber::EnvFilter;

/// Echo every message back to its sender over RDMA.
#[derive(Parser, Debug)]
#[command(name = "server", version, about)]
struct Args {
    /// Address to bind
    ip: IpAddr,

    /// Port to bind
    port: u16,

    /// Path to a TOML file with an `[echo]` table
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match &args.config {
        Some(path) => EchoConfig::load_toml(path)?,
        None => EchoConfig::default(),
    };

    let server = EchoServer::bind(VerbsProvider, &config, SocketAddr::new(args.ip, args.port))?;
    if let Some(addr) = server.local_addr() {
        println!("Listening to port {}", addr.port());
    }
    server.serve()?;
    Ok(())
}
