mod routes;
mod state;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing_subscriber::EnvFilter;

use propnet_protocol::{
    FileStorage, GossipConfig, GossipNode, HttpTransport, MemoryStorage, NetworkState, PeerEndpoint,
    PrimitiveRegistry, SchedulerConfig, SchedulerMode, StorageAdapter,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scheduling {
    Immediate,
    Batch,
}

#[derive(Parser)]
#[command(name = "propnet-node", about = "Propagation network node with a gossip endpoint")]
struct Cli {
    /// Node ID (generated when omitted)
    #[arg(long, env = "PROPNET_NODE_ID")]
    node_id: Option<String>,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:7450", env = "PROPNET_LISTEN")]
    listen: String,

    /// URL peers use to reach this node
    #[arg(long, env = "PROPNET_PUBLIC_URL")]
    public_url: Option<String>,

    /// Network description (JSON). Falls back to the persisted copy.
    #[arg(long, env = "PROPNET_NETWORK")]
    network: Option<PathBuf>,

    /// Network ID, used to find the persisted description
    #[arg(long, default_value = "default", env = "PROPNET_NETWORK_ID")]
    network_id: String,

    /// Groups this node owns (comma-separated)
    #[arg(long = "own", env = "PROPNET_OWN", value_delimiter = ',', required = true)]
    owned: Vec<String>,

    /// Seed peers as id=url (comma-separated)
    #[arg(long = "seed", env = "PROPNET_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// Data directory for persistence
    #[arg(long, default_value = "./node-data", env = "PROPNET_DATA_DIR")]
    data_dir: String,

    /// Keep everything in memory instead of the data directory
    #[arg(long, env = "PROPNET_MEMORY")]
    memory: bool,

    #[arg(long, default_value = "5000", env = "PROPNET_HEARTBEAT_MS")]
    heartbeat_ms: u64,

    #[arg(long, default_value = "3", env = "PROPNET_MISSED_HEARTBEATS")]
    missed_heartbeats: u32,

    #[arg(long, default_value = "30000", env = "PROPNET_SYNC_MS")]
    sync_ms: u64,

    #[arg(long, default_value = "3", env = "PROPNET_SYNC_FANOUT")]
    sync_fanout: usize,

    #[arg(long, default_value = "2000", env = "PROPNET_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: u64,

    #[arg(long, value_enum, default_value = "immediate", env = "PROPNET_SCHEDULER")]
    scheduler: Scheduling,

    #[arg(long, default_value = "100", env = "PROPNET_BATCH_SIZE")]
    batch_size: usize,

    #[arg(long, default_value = "50", env = "PROPNET_BATCH_DELAY_MS")]
    batch_delay_ms: u64,

    /// Propagation steps allowed per write
    #[arg(long, default_value = "10000", env = "PROPNET_MAX_ITERATIONS")]
    max_iterations: usize,
}

impl Cli {
    fn gossip_config(&self) -> Result<GossipConfig> {
        let node_id = self.node_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let public_url = match &self.public_url {
            Some(url) => url.clone(),
            None => format!("http://{}", self.listen.replace("0.0.0.0", "127.0.0.1")),
        };
        let seed_peers = self.seeds.iter().map(|s| parse_seed(s)).collect::<Result<Vec<_>>>()?;
        let mode = match self.scheduler {
            Scheduling::Immediate => SchedulerMode::Immediate,
            Scheduling::Batch => SchedulerMode::Batch,
        };

        Ok(GossipConfig {
            node_id,
            network_id: self.network_id.clone(),
            listen_addr: self.listen.clone(),
            public_url,
            seed_peers,
            heartbeat_interval_ms: self.heartbeat_ms,
            missed_heartbeat_threshold: self.missed_heartbeats,
            sync_interval_ms: self.sync_ms,
            sync_fanout: self.sync_fanout,
            request_timeout_ms: self.request_timeout_ms,
            scheduler: SchedulerConfig {
                mode,
                batch_size: self.batch_size,
                batch_delay_ms: self.batch_delay_ms,
                max_iterations: self.max_iterations,
            },
            ..Default::default()
        })
    }
}

/// `id=url` → endpoint
fn parse_seed(raw: &str) -> Result<PeerEndpoint> {
    let (id, url) = raw
        .trim()
        .split_once('=')
        .with_context(|| format!("Seed {raw:?} is not of the form id=url"))?;
    if id.is_empty() || url.is_empty() {
        anyhow::bail!("Seed {raw:?} is not of the form id=url");
    }
    Ok(PeerEndpoint::new(id, url.trim_end_matches('/')))
}

async fn load_network(cli: &Cli, storage: &dyn StorageAdapter) -> Result<NetworkState> {
    if let Some(path) = &cli.network {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read network description {}", path.display()))?;
        return serde_json::from_str(&data).context("Failed to parse network description");
    }
    storage
        .load_network_state(&cli.network_id)
        .await?
        .with_context(|| format!("No --network given and nothing persisted for {}", cli.network_id))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = cli.gossip_config()?;
    tracing::info!(
        node_id = %config.node_id,
        listen = %config.listen_addr,
        public_url = %config.public_url,
        seeds = config.seed_peers.len(),
        "Starting propnet node"
    );

    let storage: Arc<dyn StorageAdapter> = if cli.memory {
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(FileStorage::new(&cli.data_dir))
    };
    storage.initialize().await?;
    let network = load_network(&cli, storage.as_ref()).await?;

    let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
    let listen_addr = config.listen_addr.clone();
    let node = Arc::new(GossipNode::new(
        config,
        transport,
        storage,
        Arc::new(PrimitiveRegistry::with_builtins()),
    ));

    node.join_network(network, cli.owned.clone()).await?;
    node.spawn_background().await;

    let app = routes::create_router(state::AppState::new(node.clone()))
        .layer(RequestBodyLimitLayer::new(4 * 1024 * 1024))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    node.shutdown().await;
    tracing::info!("Node shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
