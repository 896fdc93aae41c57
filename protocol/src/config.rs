use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{NetworkId, NodeId, PeerEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    #[default]
    Immediate,
    Batch,
}

/// How writes are turned into propagation runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
    /// Writes per batch flush, and the queue length that triggers one
    pub batch_size: usize,
    /// Delay after the first unflushed write before a flush (milliseconds)
    pub batch_delay_ms: u64,
    /// Propagation steps allowed per external write
    pub max_iterations: usize,
}

impl SchedulerConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Immediate,
            batch_size: 100,
            batch_delay_ms: 50,
            max_iterations: 10_000,
        }
    }
}

/// Configuration for one gossip node
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// This node's unique ID
    pub node_id: NodeId,
    pub network_id: NetworkId,
    /// Address the HTTP endpoint binds (e.g. "0.0.0.0:7450")
    pub listen_addr: String,
    /// Base URL peers reach us at (e.g. "http://myhost:7450")
    pub public_url: String,
    /// Peers to connect to when joining
    pub seed_peers: Vec<PeerEndpoint>,
    /// How often to probe peers (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Missed probes in a row before a peer is disconnected
    pub missed_heartbeat_threshold: u32,
    /// How often to run a sync-request round (milliseconds)
    pub sync_interval_ms: u64,
    /// Peers asked per sync round
    pub sync_fanout: usize,
    /// Timeout for a single request to a peer (milliseconds)
    pub request_timeout_ms: u64,
    /// Concurrent sends during a broadcast
    pub max_concurrent_sends: usize,
    /// How long shutdown waits for background work (milliseconds)
    pub shutdown_grace_ms: u64,
    /// Attempts per storage save before the write is reported degraded
    pub storage_retries: u32,
    pub scheduler: SchedulerConfig,
}

impl GossipConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            network_id: "default".into(),
            listen_addr: "0.0.0.0:7450".into(),
            public_url: "http://127.0.0.1:7450".into(),
            seed_peers: vec![],
            heartbeat_interval_ms: 5_000,
            missed_heartbeat_threshold: 3,
            sync_interval_ms: 30_000,
            sync_fanout: 3,
            request_timeout_ms: 2_000,
            max_concurrent_sends: 8,
            shutdown_grace_ms: 5_000,
            storage_retries: 3,
            scheduler: SchedulerConfig::default(),
        }
    }
}
