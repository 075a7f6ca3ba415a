//! Runs a kadnet node and prints its routing table until Ctrl+C.
//!
//! Run: `cargo run --example node -- --bootstrap 127.0.0.1:7777:<id hex>`

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use tracing::Level;

use kadnet::{Config, RpcManager};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on, defaults to 7777 or a random port if taken.
    #[arg(short, long)]
    port: Option<u16>,

    /// Known node to join the network through, as `ip:port:idhex`.
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Seconds between two routing table dumps.
    #[arg(short, long, default_value_t = 10)]
    interval: u64,

    /// Log level: error, warn, info, debug or trace.
    #[arg(short, long, default_value_t = Level::INFO)]
    log: Level,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log)
        .with_thread_names(true)
        .init();

    let mut node = RpcManager::start(Config {
        port: cli.port,
        ..Default::default()
    })
    .expect("Failed to start kadnet node");

    println!("Node id: {}", node.id());
    println!("Listening on: {}", node.local_addr());

    if let Some(gateway) = cli.bootstrap {
        let (ip, port, id) = parse_gateway(&gateway).expect("Invalid --bootstrap, expected ip:port:idhex");

        node.bootstrap(port, &ip.to_string(), &id)
            .expect("Failed to bootstrap");
    }

    let (tx_interrupted, rx_interrupted) = flume::bounded::<()>(1);

    ctrlc::set_handler(move || {
        let _ = tx_interrupted.try_send(());
    })
    .expect("Error setting Ctrl-C handler");

    println!("Press CTRL+C to stop");

    loop {
        print_status(&node);

        if rx_interrupted
            .recv_timeout(Duration::from_secs(cli.interval))
            .is_ok()
        {
            break;
        }
    }

    println!("\nShutting down...");

    node.shutdown().expect("Failed to shut down cleanly");
}

fn print_status(node: &RpcManager) {
    let status = node.status();

    println!("\n=== Routing table ({} contacts) ===", status.len());

    for entry in status {
        println!(
            "{:>3}  {}  {}",
            entry.bucket_index,
            entry.contact.id,
            entry.contact.address()
        );
    }
}

/// `ip:port:idhex`, where an Ipv6 ip may itself contain colons.
fn parse_gateway(gateway: &str) -> Option<(IpAddr, u16, String)> {
    let mut parts = gateway.rsplitn(3, ':');

    let id = parts.next()?.to_string();
    let port = parts.next()?.parse().ok()?;
    let ip = parts
        .next()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()?;

    Some((ip, port, id))
}
