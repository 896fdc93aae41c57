use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Information about a known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub endpoint: PeerEndpoint,
    pub state: ConnectionState,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_rtt_ms: Option<u64>,
    pub missed_heartbeats: u32,
}

impl PeerInfo {
    pub fn peer_id(&self) -> &str {
        &self.endpoint.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// The peer registry, a thread-safe collection of known peers
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
    self_id: NodeId,
    missed_threshold: u32,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId, missed_threshold: u32) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            self_id,
            missed_threshold: missed_threshold.max(1),
        }
    }

    /// Register a peer endpoint. Returns false for ourselves or a peer we
    /// already know (whose url is refreshed).
    pub async fn add(&self, endpoint: PeerEndpoint) -> bool {
        // Don't add ourselves
        if endpoint.peer_id == self.self_id {
            return false;
        }

        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get_mut(&endpoint.peer_id) {
            existing.endpoint.url = endpoint.url;
            return false;
        }
        tracing::info!(peer = %endpoint.peer_id, url = %endpoint.url, "🌐 Discovered new peer");
        peers.insert(
            endpoint.peer_id.clone(),
            PeerInfo {
                endpoint,
                state: ConnectionState::Disconnected,
                last_seen: None,
                last_rtt_ms: None,
                missed_heartbeats: 0,
            },
        );
        true
    }

    pub async fn mark_connecting(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            if peer.state == ConnectionState::Disconnected {
                peer.state = ConnectionState::Connecting;
            }
        }
    }

    /// Mark a peer as seen: it is connected and its miss count resets
    pub async fn touch(&self, peer_id: &str, rtt_ms: Option<u64>) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            if peer.state != ConnectionState::Connected {
                tracing::info!(peer = %peer_id, "🤝 Peer connected");
            }
            peer.state = ConnectionState::Connected;
            peer.last_seen = Some(Utc::now());
            peer.missed_heartbeats = 0;
            if rtt_ms.is_some() {
                peer.last_rtt_ms = rtt_ms;
            }
        }
    }

    /// Record a failed probe. A connection attempt fails at once; a connected
    /// peer drops after `missed_threshold` failures in a row.
    pub async fn record_failure(&self, peer_id: &str) -> Option<ConnectionState> {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(peer_id)?;
        peer.missed_heartbeats += 1;
        let drop = match peer.state {
            ConnectionState::Connecting => true,
            ConnectionState::Connected => peer.missed_heartbeats >= self.missed_threshold,
            ConnectionState::Disconnected => false,
        };
        if drop {
            tracing::warn!(
                peer = %peer_id,
                missed = peer.missed_heartbeats,
                "💀 Peer disconnected"
            );
            peer.state = ConnectionState::Disconnected;
        }
        Some(peer.state)
    }

    pub async fn disconnect_all(&self) {
        let mut peers = self.peers.write().await;
        for peer in peers.values_mut() {
            peer.state = ConnectionState::Disconnected;
        }
    }

    /// Peers that currently receive broadcasts
    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values().filter(|p| p.is_connected()).cloned().collect()
    }

    /// Every known peer, whatever its state
    pub async fn all_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        let mut all: Vec<PeerInfo> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.endpoint.peer_id.cmp(&b.endpoint.peer_id));
        all
    }

    /// Pick N random connected peers for gossip fan-out
    pub async fn random_peers(&self, n: usize) -> Vec<PeerInfo> {
        use rand::seq::SliceRandom;
        let connected = self.connected_peers().await;
        if connected.len() <= n {
            return connected;
        }
        let mut rng = rand::thread_rng();
        let mut selected = connected;
        selected.shuffle(&mut rng);
        selected.truncate(n);
        selected
    }

    /// Number of connected peers
    pub async fn count(&self) -> usize {
        self.connected_peers().await.len()
    }

    /// Get a specific peer by ID
    pub async fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().await;
        peers.get(peer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new("self".into(), 3)
    }

    #[tokio::test]
    async fn test_add_skips_self_and_duplicates() {
        let peers = registry();
        assert!(!peers.add(PeerEndpoint::new("self", "http://me")).await);
        assert!(peers.add(PeerEndpoint::new("p1", "http://a")).await);
        assert!(!peers.add(PeerEndpoint::new("p1", "http://b")).await);
        let p1 = peers.get("p1").await.unwrap();
        assert_eq!(p1.endpoint.url, "http://b");
        assert_eq!(p1.state, ConnectionState::Disconnected);
        assert_eq!(peers.count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_then_miss_heartbeats() {
        let peers = registry();
        peers.add(PeerEndpoint::new("p1", "http://a")).await;
        peers.mark_connecting("p1").await;
        peers.touch("p1", Some(4)).await;
        assert_eq!(peers.count().await, 1);

        assert_eq!(peers.record_failure("p1").await, Some(ConnectionState::Connected));
        assert_eq!(peers.record_failure("p1").await, Some(ConnectionState::Connected));
        assert_eq!(peers.record_failure("p1").await, Some(ConnectionState::Disconnected));
        assert!(peers.connected_peers().await.is_empty());

        // a later probe brings it back
        peers.touch("p1", None).await;
        let p1 = peers.get("p1").await.unwrap();
        assert!(p1.is_connected());
        assert_eq!(p1.missed_heartbeats, 0);
        assert_eq!(p1.last_rtt_ms, Some(4));
    }

    #[tokio::test]
    async fn test_failed_connection_attempt_disconnects() {
        let peers = registry();
        peers.add(PeerEndpoint::new("p1", "http://a")).await;
        peers.mark_connecting("p1").await;
        assert_eq!(peers.record_failure("p1").await, Some(ConnectionState::Disconnected));
        assert_eq!(peers.record_failure("unknown").await, None);
    }

    #[tokio::test]
    async fn test_random_peers_only_connected() {
        let peers = registry();
        for i in 0..5 {
            let id = format!("p{i}");
            peers.add(PeerEndpoint::new(id.clone(), format!("http://{id}"))).await;
            if i % 2 == 0 {
                peers.touch(&id, None).await;
            }
        }
        let picked = peers.random_peers(2).await;
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|p| p.is_connected()));
        assert_eq!(peers.random_peers(10).await.len(), 3);

        peers.disconnect_all().await;
        assert_eq!(peers.count().await, 0);
        assert_eq!(peers.all_peers().await.len(), 5);
    }
}
