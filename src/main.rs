use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chain::{HeaderChain, SharedChainView};
use clap::Parser;
use containers::devnet::generate_chain;
use metrics::Metrics;
use metrics::server::{MetricsServerConfig, run_metrics_server};
use networking::loopback::LoopbackPeer;
use networking::sync::{BlockCatchup, CatchupConfig};
use parking_lot::Mutex;
use tokio::task;
use tracing::{info, warn};

/// Catch up a local header chain from in-process peers serving a devnet chain.
#[derive(Parser, Debug)]
struct Args {
    /// Length of the served chain, genesis included.
    #[arg(short, long, default_value_t = 500)]
    blocks: usize,

    /// Number of serving peers; the first one also serves headers.
    #[arg(short, long, default_value_t = 2)]
    peers: usize,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Start from the initial hash only, without the genesis header.
    #[arg(long)]
    start_empty: bool,

    /// The header peer withholds every Nth block, leaving it to the others.
    #[arg(long)]
    withhold_every: Option<usize>,

    /// YAML file with catch-up settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    min_height: Option<u64>,

    #[arg(long)]
    batch_grace_ms: Option<u64>,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    /// Serve Prometheus metrics on this port.
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl Args {
    fn catchup_config(&self) -> Result<CatchupConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("failed to open config {}", path.display()))?;
                serde_yaml::from_reader(file)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => CatchupConfig::default(),
        };

        if let Some(batch_size) = self.batch_size {
            config.initial_batch_size = batch_size;
        }
        if let Some(min_height) = self.min_height {
            config.min_height = min_height;
        }
        if let Some(grace) = self.batch_grace_ms {
            config.batch_grace_ms = grace;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.catchup_config()?;
    let metrics = Arc::new(Metrics::new());

    if let Some(port) = args.metrics_port {
        let server_config = MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port: port,
        };
        let metrics = metrics.clone();
        task::spawn(async move {
            if let Err(err) = run_metrics_server(server_config, metrics).await {
                warn!(error = %err, "Metrics server exited");
            }
        });
    }

    let blocks = generate_chain(args.blocks.max(1), args.seed);
    let chain = if args.start_empty {
        HeaderChain::new(blocks[0].hash())
    } else {
        HeaderChain::from_genesis(blocks[0].header.clone())
    };
    let chain: SharedChainView = Arc::new(Mutex::new(chain));

    let header_peer = Arc::new(LoopbackPeer::new(blocks.clone()));
    if let Some(every) = args.withhold_every.filter(|every| *every > 0) {
        header_peer.withhold(blocks.iter().step_by(every).skip(1).map(|block| block.hash()));
    }

    let mut catchup = BlockCatchup::new(config, chain.clone(), header_peer).with_metrics(metrics);
    for _ in 1..args.peers.max(1) {
        catchup = catchup.with_peer(Arc::new(LoopbackPeer::new(blocks.clone())));
    }
    let mut catchup = catchup.start().await?;

    let mut delivered = 0u64;
    while let Some(block) = catchup.next_block().await? {
        info!(
            height = block.height,
            hash = %block.hash(),
            transactions = block.block.transactions.len(),
            "Block delivered"
        );
        delivered += 1;
    }

    for peer in catchup.peers() {
        info!(
            peer = %peer.peer_id,
            delivered = peer.blocks_delivered,
            missed = peer.blocks_missed,
            "Peer summary"
        );
    }
    info!(
        delivered,
        tip = ?chain.lock().last_height(),
        "Catch-up finished"
    );

    Ok(())
}
