//! countmeshd: one node of the distinct-count mesh.
//!
//! Boot order matters: configuration is validated before anything touches
//! the disk or the network, the durable snapshot (if any) is recovered
//! next, and only then do the RPC server, the gossip loop and the async
//! committer start. Shutdown flushes once more so `async` durability loses
//! nothing on a clean exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use countmesh_node::config::DEFAULT_PRECISION;
use countmesh_node::durability::{FileSnapshotStore, SnapshotStore};
use countmesh_node::{
    Aggregator, Backpressure, DurabilityLevel, GossipProtocol, NodeConfig, PeerConfig, RpcServer,
    TcpTransport,
};

#[derive(Debug, Parser)]
#[clap(name = "countmeshd", about = "Decentralized distinct-count node", version)]
struct Cli {
    /// Identifier of this node within the mesh.
    #[clap(long)]
    node_id: String,

    /// Name of the sketch this node hosts.
    #[clap(long, default_value = "default")]
    sketch_id: String,

    /// Address for the RPC server to listen on.
    #[clap(long, default_value = "127.0.0.1:6000")]
    listen: SocketAddr,

    /// Peer to gossip with, as id=host:port. Repeatable.
    #[clap(long = "peer")]
    peers: Vec<PeerConfig>,

    /// Sketch precision p; registers = 2^p.
    #[clap(long, default_value_t = DEFAULT_PRECISION)]
    precision: u8,

    /// Durability level: none, async or sync.
    #[clap(long, default_value = "none")]
    durability: DurabilityLevel,

    /// File path for persisting the sketch (required for async/sync).
    #[clap(long)]
    sketch_file: Option<PathBuf>,

    /// Overwrite the snapshot in place instead of temp-file-and-rename.
    #[clap(long)]
    no_atomic_replace: bool,

    /// Milliseconds between gossip rounds.
    #[clap(long, default_value_t = 1000)]
    gossip_interval_ms: u64,

    /// Per-round timeout in milliseconds.
    #[clap(long, default_value_t = 1000)]
    round_timeout_ms: u64,

    /// Consecutive failures before a peer is deprioritized.
    #[clap(long, default_value_t = 3)]
    failure_threshold: u32,

    /// Milliseconds between async-durability flushes.
    #[clap(long, default_value_t = 5000)]
    flush_interval_ms: u64,

    /// Flush attempts before the node degrades to read-only.
    #[clap(long, default_value_t = 3)]
    flush_retries: u32,

    /// Unflushed-mutation bound before backpressure applies.
    #[clap(long, default_value_t = 100_000)]
    max_pending: u64,

    /// What to do with inserts past the bound: block or reject.
    #[clap(long, default_value = "block")]
    backpressure: Backpressure,

    /// Ingest newline-delimited elements from stdin.
    #[clap(long)]
    stdin: bool,
}

impl Cli {
    fn into_config(self) -> (NodeConfig, bool) {
        let config = NodeConfig {
            node_id: self.node_id,
            sketch_id: self.sketch_id,
            listen: self.listen,
            peers: self.peers,
            precision: self.precision,
            durability: self.durability,
            sketch_file: self.sketch_file,
            atomic_replace: self.durability.is_durable() && !self.no_atomic_replace,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            flush_retries: self.flush_retries,
            max_pending: self.max_pending,
            backpressure: self.backpressure,
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            round_timeout: Duration::from_millis(self.round_timeout_ms),
            failure_threshold: self.failure_threshold,
        };
        (config, self.stdin)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (config, ingest) = Cli::parse().into_config();
    // Fail before any file or socket is touched.
    config.validate().context("invalid configuration")?;
    tracing::info!(
        node = %config.node_id,
        listen = %config.listen,
        peers = config.peers.len(),
        precision = config.precision,
        durability = %config.durability,
        "starting countmeshd"
    );

    let store: Option<Arc<dyn SnapshotStore>> = config
        .sketch_file
        .as_ref()
        .filter(|_| config.durability.is_durable())
        .map(|path| {
            Arc::new(FileSnapshotStore::new(path, config.atomic_replace)) as Arc<dyn SnapshotStore>
        });
    let aggregator = Arc::new(
        Aggregator::new(&config, store)
            .await
            .context("failed to start node")?,
    );
    if !aggregator.has_peers() {
        tracing::info!("no peers configured; serving standalone until peers are set");
    }

    let server = RpcServer::bind(config.listen, aggregator.clone())
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let server_task = tokio::spawn(server.serve());

    let transport = Arc::new(TcpTransport::new(config.round_timeout));
    let gossip = Arc::new(GossipProtocol::new(
        aggregator.clone(),
        transport,
        &config,
    ));
    let gossip_task = tokio::spawn(gossip.run());

    let committer_task = (config.durability == DurabilityLevel::Async).then(|| {
        tokio::spawn(
            aggregator
                .clone()
                .run_committer(config.flush_interval),
        )
    });

    let ingest_task = ingest.then(|| tokio::spawn(ingest_stdin(aggregator.clone())));

    shutdown_signal().await?;
    tracing::info!("shutdown signal received");

    gossip_task.abort();
    server_task.abort();
    if let Some(task) = committer_task {
        task.abort();
    }
    if let Some(task) = ingest_task {
        task.abort();
    }

    // One final flush so async durability does not lose the tail.
    match aggregator.flush().await {
        Ok(flushed) => {
            if flushed {
                tracing::info!(version = aggregator.snapshot_version(), "final snapshot flushed");
            }
        }
        Err(e) => tracing::error!(error = %e, "final flush failed"),
    }

    Ok(())
}

/// ingest_stdin feeds newline-delimited elements into the local sketch
/// until stdin closes.
async fn ingest_stdin(aggregator: Arc<Aggregator>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = aggregator.insert(line.as_bytes()).await {
                    tracing::warn!(error = %e, "stdin insert rejected");
                }
            }
            Ok(None) => {
                tracing::info!("stdin closed, ingestion finished");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                return;
            }
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
