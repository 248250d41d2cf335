use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use blossom_overlay::{Bitmask, MemoryNetwork, Overlay, P2PConfig, SubscribeMode};

/// Shard every node in the local cluster joins.
const GREETING_BIT: usize = 0;

#[derive(Parser, Debug)]
#[command(name = "blossom-overlay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address of the first node (overrides the config file).
    #[arg(short, long)]
    listen: Option<String>,

    /// Bootstrap peer as ADDR/PEER_ID; repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<String>,

    /// Distinct peers each node must connect to during discovery.
    #[arg(short, long)]
    min_peers: Option<usize>,

    /// Number of nodes in the in-process cluster.
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Seconds between status reports.
    #[arg(short, long, default_value = "10")]
    status_interval: u64,
}

fn init_tracing(trace_log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    let json = match trace_log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open trace log {}", path.display()))?;
            Some(fmt::layer().json().with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => P2PConfig::from_toml_file(path)?,
        None => P2PConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    config.bootstrap_peers.extend(args.bootstrap.iter().cloned());
    let cluster_size = args.nodes.max(1);
    config.min_peers = args
        .min_peers
        .unwrap_or(if config.min_peers == 0 { cluster_size - 1 } else { config.min_peers });

    init_tracing(config.trace_log_file.as_deref())?;

    let network = Arc::new(MemoryNetwork::new());
    let first = Overlay::create(&config, network.clone())
        .await
        .context("failed to start overlay node")?;
    info!(peer_id = %first.peer_id(), addrs = ?first.listen_addrs(), "node 0 started");

    let mut nodes = vec![first];
    for index in 1..cluster_size {
        let node_config = P2PConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            peer_priv_key: String::new(),
            bootstrap_peers: nodes[0].bootstrap_addrs(),
            trace_log_file: None,
            ..config.clone()
        };
        let node = Overlay::create(&node_config, network.clone())
            .await
            .with_context(|| format!("failed to start node {index}"))?;
        info!(index, peer_id = %node.peer_id(), "node started");
        nodes.push(node);
    }

    let shard = Bitmask::elementary(GREETING_BIT).context("greeting bit out of range")?;
    for node in &nodes {
        let me = node.peer_id();
        node.subscribe(
            shard,
            move |msg| {
                info!(
                    node = %me.short(),
                    from = %msg.from.short(),
                    text = %String::from_utf8_lossy(&msg.data),
                    "received greeting"
                );
                Ok(())
            },
            SubscribeMode::Raw,
        )
        .await?;
    }

    for node in &nodes {
        let status = node.wait_for_discovery().await;
        info!(peer_id = %node.peer_id(), ?status, "discovery finished");
    }

    for node in &nodes {
        let greeting = format!("hello from {}", node.peer_id().short());
        if let Err(e) = node.publish_to_bitmask(shard, greeting.into_bytes()).await {
            warn!(error = %e, "failed to publish greeting");
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                for node in &nodes {
                    let mesh_peer = node.random_peer(&shard).await.ok();
                    info!(
                        peer_id = %node.peer_id().short(),
                        connected = node.network_peers_count().await,
                        known = node.peerstore_count().await,
                        subscriptions = node.subscriptions().await.len(),
                        discovery = ?node.discovery_status(),
                        sampled_peer = ?mesh_peer,
                        "status"
                    );
                }
            }
        }
    }

    for node in &nodes {
        node.shutdown();
    }

    Ok(())
}
