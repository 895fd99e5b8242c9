//! Runs one node of a replicated key-value cluster over HTTP.
//!
//! The same listener serves the client API and the peer RPCs.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin raft-kv-node -- \
//!   --id 1 --listen 127.0.0.1:7101 --data-dir /tmp/raft-kv/1 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102 --peer 3=127.0.0.1:7103
//!
//! # Terminal 2 (node 2)
//! cargo run --bin raft-kv-node -- \
//!   --id 2 --listen 127.0.0.1:7102 --data-dir /tmp/raft-kv/2 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102 --peer 3=127.0.0.1:7103
//!
//! # Terminal 3 (node 3)
//! cargo run --bin raft-kv-node -- \
//!   --id 3 --listen 127.0.0.1:7103 --data-dir /tmp/raft-kv/3 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102 --peer 3=127.0.0.1:7103
//!
//! # Any terminal
//! curl -X PUT localhost:7101/kv/color -H 'content-type: application/json' -d '{"value":"red"}'
//! curl localhost:7101/kv/color
//! curl localhost:7102/status
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueHint};
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_kv::transport::HttpPeerSender;
use raft_kv::{KvStore, Node, NodeConfig, NodeId, server};

/// Command-line arguments for a node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value node")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: NodeId,

    /// Address to serve clients and peers on, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Directory holding this node's write-ahead log and snapshot
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 150)]
    election_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    /// Compact the log once it holds more entries than this (0 disables)
    #[arg(long, default_value_t = 1024)]
    snapshot_threshold: u64,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut addrs = parse_peers(&args.peer)?;

    // Validate that this node's ID maps to its listen address
    if addrs.get(&args.id).map(String::as_str) != Some(args.listen.as_str()) {
        return Err(anyhow!(
            "self id {} must map to listen addr {} via --peer entries",
            args.id,
            args.listen
        ));
    }
    addrs.remove(&args.id);

    let mut peers: Vec<NodeId> = addrs.keys().copied().collect();
    peers.sort_unstable();
    let mut config = NodeConfig::new(args.id, peers, &args.data_dir);
    config.election_timeout_min = Duration::from_millis(args.election_min_ms);
    config.election_timeout_max = Duration::from_millis(args.election_max_ms);
    config.heartbeat_interval = Duration::from_millis(args.heartbeat_ms);
    config.snapshot_threshold = args.snapshot_threshold;

    let sender = HttpPeerSender::new(addrs, config.rpc_timeout)?;
    let node = Node::start(config, Box::new(KvStore::new()), Arc::new(sender))?;

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(node = args.id, addr = %args.listen, "listening");

    axum::serve(listener, server::router(node.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    node.stop().await?;
    info!(node = args.id, "shut down");
    Ok(())
}

/// Parses peer entries from the command line into a map.
fn parse_peers(entries: &[String]) -> Result<HashMap<NodeId, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: NodeId = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        if peers.insert(id, addr.to_string()).is_some() {
            return Err(anyhow!("peer id {id} listed more than once"));
        }
    }
    if peers.is_empty() {
        return Err(anyhow!(
            "at least one --peer entry is required (include self)"
        ));
    }
    Ok(peers)
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
