use std::io::{self, BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use clap::Parser;
use rdma_echo::{provider::verbs::VerbsProvider, EchoClient, EchoConfig, Reply, EXIT_SENTINEL};
use tracing_subscriber::EnvFilter;

/// Send whitespace-separated words from stdin to an echo server over RDMA.
#[derive(Parser, Debug)]
#[command(name = "client", version, about)]
struct Args {
    /// Server address
    ip: IpAddr,

    /// Server port
    port: u16,

    /// Path to a TOML file with an `[echo]` table
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Forward stdin tokens until the sentinel or end of input.
fn read_input(input: mpsc::Sender<String>) {
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        for token in line.split_whitespace() {
            let done = token == EXIT_SENTINEL;
            if input.send(token.to_owned()).is_err() || done {
                return;
            }
        }
    }
}

fn print_replies(replies: mpsc::Receiver<Reply>) {
    let mut stdout = io::stdout();
    for reply in replies {
        let _ = writeln!(stdout, "{} ({:.2?})", reply.text(), reply.rtt);
        let _ = stdout.flush();
    }
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

    let (input_tx, input) = mpsc::channel();
    let (replies, replies_rx) = mpsc::channel();
    // Stdin reads cannot be interrupted, so this thread is never joined.
    thread::spawn(move || read_input(input_tx));
    let printer = thread::spawn(move || print_replies(replies_rx));

    let summary = EchoClient::new(VerbsProvider, config).run(
        SocketAddr::new(args.ip, args.port),
        input,
        replies,
    )?;
    let _ = printer.join();

    println!("Bye!");
    log::debug!("{:?}", summary);
    Ok(())
}
