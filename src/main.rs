use std::path::PathBuf;

use clap::Parser;
use raft_node::config::{parse_peer_args, Config, NodeOptions};
use raft_node::server::Server;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// This node's numeric ID (must be unique in the cluster).
    #[arg(long)]
    id: u64,

    /// TCP address to listen on for Raft RPCs.
    #[arg(long)]
    addr: String,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Directory for the block journal.
    #[arg(long)]
    data_dir: PathBuf,

    /// Address for the HTTP key-value API.
    #[arg(long)]
    client_addr: Option<String>,

    /// Create a new cluster with this node as leader instead of joining one.
    #[arg(long)]
    bootstrap: bool,

    /// Keep the whole log uncompressed in memory.
    #[arg(long)]
    no_compaction: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let config = Config {
        id: args.id,
        addr: args.addr,
        peers: parse_peer_args(&args.peers)?,
        data_dir: args.data_dir,
        client_addr: args.client_addr,
        bootstrap: args.bootstrap,
        compaction: !args.no_compaction,
        options: NodeOptions::default(),
    };

    Server::run(config).await?;
    Ok(())
}
