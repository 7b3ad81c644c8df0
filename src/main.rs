use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use trackerless::{DhtConfig, DhtNode};

#[derive(Parser, Debug)]
#[command(name = "trackerless")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// Node to bootstrap from (repeatable).
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Well-known router used only as a lookup seed (repeatable).
    #[arg(short = 'R', long = "router", value_name = "ADDR")]
    routers: Vec<SocketAddr>,

    /// Query the network without answering queries or entering routing tables.
    #[arg(long)]
    read_only: bool,

    #[arg(long, default_value_t = DhtConfig::default().max_items)]
    max_items: usize,

    #[arg(long, default_value_t = DhtConfig::default().max_swarms)]
    max_swarms: usize,

    #[arg(long, default_value_t = DhtConfig::default().max_peers_per_swarm)]
    max_peers: usize,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = DhtConfig {
        read_only: args.read_only,
        max_items: args.max_items,
        max_swarms: args.max_swarms,
        max_peers_per_swarm: args.max_peers,
        ..DhtConfig::default()
    };
    let node = DhtNode::bind(args.bind, config)
        .await
        .context("failed to start DHT node")?;
    info!("Node id: {}", node.id());

    for router in &args.routers {
        node.add_router_node(*router);
    }

    if !args.bootstrap.is_empty() || !args.routers.is_empty() {
        match node.bootstrap(&args.bootstrap).await {
            Ok(found) => info!(nodes = found.len(), "Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    let mut status = time::interval(Duration::from_secs(args.status_interval.max(1)));
    let mut next_tick = node.tick();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = time::sleep(next_tick) => {
                next_tick = node.tick();
            }
            _ = status.tick() => {
                let s = node.status();
                info!(
                    state = %s.state,
                    nodes = s.routing_nodes,
                    swarms = s.swarms,
                    peers = s.peers,
                    immutable = s.immutable_items,
                    mutable = s.mutable_items,
                    resources = s.resource_items,
                    traversals = s.traversals,
                    "status snapshot"
                );
            }
        }
    }

    node.shutdown();
    Ok(())
}
