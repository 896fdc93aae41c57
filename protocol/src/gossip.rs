use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::GossipConfig;
use crate::convergence::{self, ConvergenceReport, Ownership};
use crate::error::{NodeError, PropagationError, StorageError};
use crate::network::Topology;
use crate::peer::{PeerInfo, PeerRegistry};
use crate::primitive::PrimitiveRegistry;
use crate::scheduler::{ContactChange, Outcome, PendingWrite, PropagationReport, Propagator, Scheduler, Scope};
use crate::storage::StorageAdapter;
use crate::transport::{GossipHandler, GossipTransport};
use crate::types::*;

/// Everything a node holds once it has joined a network
struct Joined {
    network_id: NetworkId,
    engine: Arc<Mutex<Propagator>>,
    scheduler: Scheduler,
    ownership: Ownership,
}

/// A propnet gossip node: one replica of a partitioned propagation network.
///
/// Each GossipNode:
/// 1. Owns a subset of the network's groups and replicates its expected set
/// 2. Runs writes through its propagator and persists what settles
/// 3. Broadcasts settled contacts to connected peers and merges theirs
/// 4. Probes peers with heartbeats and repairs missed updates with sync rounds
pub struct GossipNode {
    pub config: GossipConfig,
    pub peers: PeerRegistry,
    transport: Arc<dyn GossipTransport>,
    storage: Arc<dyn StorageAdapter>,
    primitives: Arc<PrimitiveRegistry>,
    joined: RwLock<Option<Arc<Joined>>>,
    outcomes: Mutex<Option<mpsc::UnboundedReceiver<Outcome>>>,
    accepting: AtomicBool,
    degraded_writes: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipNode {
    pub fn new(
        config: GossipConfig,
        transport: Arc<dyn GossipTransport>,
        storage: Arc<dyn StorageAdapter>,
        primitives: Arc<PrimitiveRegistry>,
    ) -> Self {
        let peers = PeerRegistry::new(config.node_id.clone(), config.missed_heartbeat_threshold);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            peers,
            transport,
            storage,
            primitives,
            joined: RwLock::new(None),
            outcomes: Mutex::new(None),
            accepting: AtomicBool::new(true),
            degraded_writes: AtomicU64::new(0),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Take part in `description`, owning `owned` groups and their subtrees.
    ///
    /// Persisted content for the expected set is restored before any gossip
    /// is processed. Seed peers are contacted best-effort.
    pub async fn join_network(&self, description: NetworkState, owned: Vec<GroupId>) -> Result<(), NodeError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(NodeError::ShuttingDown);
        }
        self.storage.initialize().await?;

        let topology = Topology::new(description)?;
        let ownership = Ownership::assign(&topology, &owned)?;
        let network_id = topology.network_id().to_string();
        if network_id != self.config.network_id {
            tracing::warn!(
                configured = %self.config.network_id,
                joined = %network_id,
                "Joining a network other than the configured one"
            );
        }

        let scope = Scope::limited(ownership.expected.clone(), ownership.gadgets.clone());
        let mut propagator = Propagator::new(
            topology,
            self.primitives.clone(),
            self.config.node_id.clone(),
            self.config.scheduler.max_iterations,
        )?
        .with_scope(scope);

        let restored = self.restore(&mut propagator, &network_id, &ownership).await;

        self.save_with_retry("network state", || self.storage.save_network_state(propagator.topology().state()))
            .await;
        for group in &ownership.groups {
            if let Some(state) = propagator.topology().group_state(group) {
                self.save_with_retry("group state", || self.storage.save_group_state(&network_id, state)).await;
            }
        }

        let engine = Arc::new(Mutex::new(propagator));
        let (scheduler, outcomes) = Scheduler::new(engine.clone(), &self.config.scheduler);
        *self.outcomes.lock().await = outcomes;

        tracing::info!(
            node_id = %self.config.node_id,
            network = %network_id,
            owned_groups = ownership.groups.len(),
            expected = ownership.expected.len(),
            restored,
            "🌱 Joined network"
        );
        *self.joined.write().await = Some(Arc::new(Joined { network_id, engine, scheduler, ownership }));

        let seeds = self.config.seed_peers.clone();
        let attempts = seeds.into_iter().map(|seed| async move {
            if let Err(e) = self.connect_to_peer(seed.clone()).await {
                tracing::warn!(peer = %seed.peer_id, url = %seed.url, error = %e, "Failed to connect to seed");
            }
        });
        futures::future::join_all(attempts).await;

        tracing::info!(peers = self.peers.count().await, "Bootstrap complete");
        Ok(())
    }

    async fn restore(&self, propagator: &mut Propagator, network_id: &str, ownership: &Ownership) -> usize {
        let mut restored = 0;
        for contact_id in ownership.expected_sorted() {
            let Some(group_id) = propagator.topology().contact(&contact_id).map(|c| c.group_id.clone()) else {
                continue;
            };
            match self.storage.load_contact_content(network_id, &group_id, &contact_id).await {
                Ok(Some(stored)) => {
                    if propagator.seed(&contact_id, stored) {
                        restored += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(contact = %contact_id, error = %e, "Failed to restore contact content"),
            }
        }
        restored
    }

    /// Register a peer and probe it once. Failures leave the peer known but
    /// disconnected; the heartbeat loop keeps retrying it.
    pub async fn connect_to_peer(&self, endpoint: PeerEndpoint) -> anyhow::Result<()> {
        let peer_id = endpoint.peer_id.clone();
        self.peers.add(endpoint.clone()).await;
        self.peers.mark_connecting(&peer_id).await;
        match self.probe(&endpoint).await {
            Ok(rtt) => {
                self.peers.touch(&peer_id, Some(rtt)).await;
                Ok(())
            }
            Err(e) => {
                self.peers.record_failure(&peer_id).await;
                Err(e)
            }
        }
    }

    async fn probe(&self, endpoint: &PeerEndpoint) -> anyhow::Result<u64> {
        let nonce: u64 = rand::random();
        let started = Instant::now();
        let msg = GossipMessage::Heartbeat { sender: self.config.node_id.clone(), nonce };
        let resp = self.send(endpoint, &msg).await?;
        let echoed = resp
            .replies
            .iter()
            .any(|reply| matches!(reply, GossipMessage::Heartbeat { nonce: n, .. } if *n == nonce));
        if !echoed {
            anyhow::bail!("Peer {} did not echo the heartbeat", endpoint.peer_id);
        }
        Ok(started.elapsed().as_millis() as u64)
    }

    async fn send(&self, endpoint: &PeerEndpoint, msg: &GossipMessage) -> anyhow::Result<GossipResponse> {
        tokio::time::timeout(self.config.request_timeout(), self.transport.send(endpoint, msg))
            .await
            .context("Request timed out")?
    }

    async fn joined(&self) -> Result<Arc<Joined>, NodeError> {
        self.joined.read().await.clone().ok_or(NodeError::NotJoined)
    }

    /// Write a value into a replicated contact.
    ///
    /// In immediate mode the write has settled (and been persisted and
    /// broadcast) when this returns; in batch mode it is queued and `None`
    /// comes back.
    pub async fn update_contact(&self, contact_id: &str, value: Value) -> Result<Option<PropagationReport>, NodeError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(NodeError::ShuttingDown);
        }
        let joined = self.joined().await?;
        if joined.engine.lock().await.topology().contact(contact_id).is_none() {
            return Err(PropagationError::UnknownContact(contact_id.to_string()).into());
        }
        if !joined.ownership.expects(contact_id) {
            return Err(NodeError::NotReplicated(contact_id.to_string()));
        }

        tracing::debug!(contact = %contact_id, value = %value, "Local write");
        let outcomes = joined.scheduler.submit(PendingWrite::local(contact_id, value)).await;
        let mut outcomes = outcomes.into_iter();
        match outcomes.next() {
            Some(Ok(report)) => {
                self.settle(&joined, std::slice::from_ref(&report)).await;
                Ok(Some(report))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Process every queued write now
    pub async fn flush(&self) -> Result<Vec<PropagationReport>, NodeError> {
        let joined = self.joined().await?;
        let outcomes = joined.scheduler.flush().await;
        Ok(self.absorb_outcomes(&joined, outcomes).await)
    }

    async fn absorb_outcomes(&self, joined: &Joined, outcomes: Vec<Outcome>) -> Vec<PropagationReport> {
        let mut reports = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => tracing::debug!(error = %e, "Queued write failed"),
            }
        }
        self.settle(joined, &reports).await;
        reports
    }

    /// Persist and broadcast what the reports settled
    async fn settle(&self, joined: &Joined, reports: &[PropagationReport]) {
        let changes: Vec<&ContactChange> = reports.iter().flat_map(|r| r.settled.iter()).collect();
        if changes.is_empty() {
            return;
        }
        for change in &changes {
            let stored = StoredContent::new(change.value.clone(), change.stamp.clone());
            self.save_with_retry("contact content", || {
                self.storage.save_contact_content(&joined.network_id, &change.group_id, &change.contact_id, &stored)
            })
            .await;
        }
        let updates = changes
            .iter()
            .map(|change| GossipMessage::Update {
                contact_id: change.contact_id.clone(),
                content: change.value.clone(),
                origin_node: change.stamp.node.clone(),
                logical_timestamp: change.stamp.time,
            })
            .collect();
        self.broadcast(updates).await;
    }

    /// Run a save, retrying with a short backoff. In-memory state is kept
    /// either way; a save that never succeeds is counted as degraded.
    async fn save_with_retry<F, Fut>(&self, what: &str, mut save: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), StorageError>>,
    {
        let attempts = self.config.storage_retries.max(1);
        for attempt in 1..=attempts {
            match save().await {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    tracing::debug!(what, attempt, error = %e, "Storage save failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(10 * attempt as u64)).await;
                }
                Err(e) => {
                    self.degraded_writes.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(what, attempts, error = %e, "⚠️ Storage save failed, durability degraded");
                }
            }
        }
    }

    /// Send messages to every connected peer, a bounded number at a time
    async fn broadcast(&self, messages: Vec<GossipMessage>) {
        let peers = self.peers.connected_peers().await;
        if peers.is_empty() || messages.is_empty() {
            return;
        }
        tracing::debug!(peers = peers.len(), messages = messages.len(), "📡 Broadcasting updates");

        // futures are built up front so the stream combinators hold no
        // borrowing closures (keeps the spawned tasks provably `Send`)
        let mut sends = Vec::with_capacity(peers.len() * messages.len());
        for peer in &peers {
            for msg in &messages {
                sends.push(async move { (peer, self.send(&peer.endpoint, msg).await) });
            }
        }
        let results: Vec<(&PeerInfo, anyhow::Result<_>)> = stream::iter(sends)
            .buffer_unordered(self.config.max_concurrent_sends.max(1))
            .collect()
            .await;
        let failures: Vec<(&PeerInfo, anyhow::Error)> =
            results.into_iter().filter_map(|(peer, result)| result.err().map(|e| (peer, e))).collect();

        for (peer, e) in failures {
            tracing::warn!(peer = %peer.peer_id(), error = %e, "Failed to deliver update");
        }
    }

    /// Handle an incoming gossip message
    pub async fn handle_message(&self, msg: GossipMessage) -> Result<GossipResponse, NodeError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(NodeError::ShuttingDown);
        }
        tracing::debug!(kind = msg.kind(), "Gossip message received");

        let replies = match msg {
            GossipMessage::Update { contact_id, content, origin_node, logical_timestamp } => {
                let stamp = Stamp::new(logical_timestamp, origin_node);
                self.apply_remote(&contact_id, content, stamp).await?;
                vec![]
            }

            GossipMessage::SyncRequest { sender, contacts } => {
                self.peers.touch(&sender, None).await;
                let joined = self.joined().await?;
                let held = joined.engine.lock().await.held(&contacts);
                tracing::debug!(from = %sender, replies = held.len(), "🔄 Answering sync request");
                held.into_iter()
                    .map(|change| GossipMessage::Update {
                        contact_id: change.contact_id,
                        content: change.value,
                        origin_node: change.stamp.node,
                        logical_timestamp: change.stamp.time,
                    })
                    .collect()
            }

            GossipMessage::Heartbeat { sender, nonce } => {
                self.peers.touch(&sender, None).await;
                vec![GossipMessage::Heartbeat { sender: self.config.node_id.clone(), nonce }]
            }
        };

        Ok(GossipResponse { node_id: self.config.node_id.clone(), replies })
    }

    /// Merge a peer's settled contact into our replica. Returns how many
    /// contacts settled as a result.
    async fn apply_remote(&self, contact_id: &str, content: Value, stamp: Stamp) -> Result<usize, NodeError> {
        let joined = self.joined().await?;
        if !joined.ownership.expects(contact_id) {
            tracing::trace!(contact = %contact_id, "Ignoring update outside the expected set");
            return Ok(0);
        }
        let outcomes = joined.scheduler.submit(PendingWrite::remote(contact_id, content, stamp)).await;
        let reports = self.absorb_outcomes(&joined, outcomes).await;
        Ok(reports.iter().map(|r| r.settled.len()).sum())
    }

    /// Ask a few connected peers for what they hold of our expected set and
    /// merge the answers. Returns how many contacts settled.
    pub async fn sync_round(&self) -> Result<usize, NodeError> {
        let joined = self.joined().await?;
        let targets = self.peers.random_peers(self.config.sync_fanout).await;
        if targets.is_empty() {
            tracing::debug!("No connected peers to sync with");
            return Ok(0);
        }

        let request = GossipMessage::SyncRequest {
            sender: self.config.node_id.clone(),
            contacts: joined.ownership.expected_sorted(),
        };
        let responses: Vec<(&PeerInfo, anyhow::Result<GossipResponse>)> = stream::iter(
            targets
                .iter()
                .map(|peer| {
                    let request = &request;
                    async move { (peer, self.send(&peer.endpoint, request).await) }
                })
                .collect::<Vec<_>>(),
        )
        .buffer_unordered(self.config.max_concurrent_sends.max(1))
            .collect()
            .await;

        let mut settled = 0;
        for (peer, response) in responses {
            match response {
                Ok(resp) => {
                    for reply in resp.replies {
                        if let GossipMessage::Update { contact_id, content, origin_node, logical_timestamp } = reply {
                            let stamp = Stamp::new(logical_timestamp, origin_node);
                            settled += self.apply_remote(&contact_id, content, stamp).await?;
                        }
                    }
                }
                Err(e) => tracing::warn!(peer = %peer.peer_id(), error = %e, "Sync request failed"),
            }
        }
        tracing::debug!(peers = targets.len(), settled, "Sync round complete");
        Ok(settled)
    }

    /// Probe every known peer once
    pub async fn heartbeat_round(&self) {
        let peers = self.peers.all_peers().await;
        let results: Vec<(&PeerInfo, anyhow::Result<u64>)> = stream::iter(
            peers.iter().map(|peer| async move { (peer, self.probe(&peer.endpoint).await) }).collect::<Vec<_>>(),
        )
        .buffer_unordered(self.config.max_concurrent_sends.max(1))
            .collect()
            .await;

        for (peer, result) in results {
            match result {
                Ok(rtt) => self.peers.touch(peer.peer_id(), Some(rtt)).await,
                Err(e) => {
                    tracing::debug!(peer = %peer.peer_id(), error = %e, "Heartbeat missed");
                    self.peers.record_failure(peer.peer_id()).await;
                }
            }
        }
    }

    pub async fn convergence(&self) -> Result<ConvergenceReport, NodeError> {
        let joined = self.joined().await?;
        let engine = joined.engine.lock().await;
        Ok(convergence::measure(engine.topology(), &joined.ownership.expected))
    }

    pub async fn content(&self, contact_id: &str) -> Result<Option<Value>, NodeError> {
        let joined = self.joined().await?;
        let engine = joined.engine.lock().await;
        if engine.topology().contact(contact_id).is_none() {
            return Err(PropagationError::UnknownContact(contact_id.to_string()).into());
        }
        Ok(engine.content(contact_id).cloned())
    }

    /// Get node status summary
    pub async fn status(&self) -> NodeStatus {
        let peers = self.peers.all_peers().await;
        let connected = peers.iter().filter(|p| p.is_connected()).count();
        let joined = self.joined.read().await.clone();
        let (network_id, pending_writes, clock, convergence) = match &joined {
            Some(joined) => {
                let pending = joined.scheduler.pending().await;
                let engine = joined.engine.lock().await;
                let report = convergence::measure(engine.topology(), &joined.ownership.expected);
                (Some(joined.network_id.clone()), pending, engine.clock(), Some(report))
            }
            None => (None, 0, 0, None),
        };

        NodeStatus {
            node_id: self.config.node_id.clone(),
            network_id,
            accepting: self.accepting.load(Ordering::SeqCst),
            connected_peers: connected,
            peers,
            pending_writes,
            degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
            clock,
            convergence,
        }
    }

    /// Start the heartbeat loop, the sync loop and, in batch mode, the pump
    /// that persists and broadcasts background flush outcomes. Call after
    /// `join_network`.
    pub async fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let node = Arc::clone(self);
        let mut stop = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(node.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = timer.tick() => node.heartbeat_round().await,
                    _ = stop.changed() => break,
                }
            }
        }));

        let node = Arc::clone(self);
        let mut stop = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(node.config.sync_interval());
            // the first tick fires at once; bootstrap already talked to the seeds
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = node.sync_round().await {
                            tracing::debug!(error = %e, "Sync round skipped");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        if let Some(mut rx) = self.outcomes.lock().await.take() {
            let node = Arc::clone(self);
            let mut stop = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        outcome = rx.recv() => match outcome {
                            Some(outcome) => node.pump(vec![outcome]).await,
                            None => break,
                        },
                        _ = stop.changed() => break,
                    }
                }
                let mut rest = Vec::new();
                while let Ok(outcome) = rx.try_recv() {
                    rest.push(outcome);
                }
                node.pump(rest).await;
            }));
        }
    }

    async fn pump(&self, outcomes: Vec<Outcome>) {
        if outcomes.is_empty() {
            return;
        }
        if let Ok(joined) = self.joined().await {
            self.absorb_outcomes(&joined, outcomes).await;
        }
    }

    /// Stop gossiping, flush queued writes, drop peers, stop background work
    /// and close storage.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node_id = %self.config.node_id, "Shutting down node");
        self.shutdown_tx.send_replace(true);

        if let Ok(joined) = self.joined().await {
            let outcomes = joined.scheduler.flush().await;
            let reports = self.absorb_outcomes(&joined, outcomes).await;
            tracing::info!(flushed = reports.len(), "Final flush complete");
        }

        self.peers.disconnect_all().await;

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        if let Err(e) = self.storage.close().await {
            tracing::warn!(error = %e, "Failed to close storage");
        }
        tracing::info!(node_id = %self.config.node_id, "Node shut down");
    }
}

#[async_trait]
impl GossipHandler for GossipNode {
    async fn handle(&self, message: GossipMessage) -> anyhow::Result<GossipResponse> {
        Ok(self.handle_message(message).await?)
    }
}

/// Node status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub network_id: Option<NetworkId>,
    pub accepting: bool,
    pub connected_peers: usize,
    pub peers: Vec<PeerInfo>,
    pub pending_writes: usize,
    pub degraded_writes: u64,
    pub clock: u64,
    pub convergence: Option<ConvergenceReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchedulerConfig, SchedulerMode};
    use crate::network::NetworkBuilder;
    use crate::storage::MemoryStorage;
    use crate::transport::LocalTransport;

    /// root ─ src { x } ─ dst { y }, x wired to y
    fn pair_network() -> NetworkState {
        let mut nb = NetworkBuilder::new("pair");
        let root = nb.root();
        let src = nb.group(&root, "src");
        let dst = nb.group(&root, "dst");
        let x = nb.boundary(&src, "x", BoundaryDirection::Output, BlendMode::AcceptLast);
        let y = nb.boundary(&dst, "y", BoundaryDirection::Input, BlendMode::AcceptLast);
        nb.wire(&x, &y);
        nb.build()
    }

    fn config(id: &str) -> GossipConfig {
        GossipConfig {
            node_id: id.into(),
            network_id: "pair".into(),
            public_url: format!("local://{id}"),
            ..Default::default()
        }
    }

    fn node(config: GossipConfig, transport: &LocalTransport, storage: Arc<MemoryStorage>) -> Arc<GossipNode> {
        Arc::new(GossipNode::new(
            config,
            Arc::new(transport.clone()),
            storage,
            Arc::new(PrimitiveRegistry::with_builtins()),
        ))
    }

    #[tokio::test]
    async fn test_calls_before_join_fail() {
        let transport = LocalTransport::new();
        let n = node(config("a"), &transport, Arc::new(MemoryStorage::new()));
        assert!(matches!(n.update_contact("x", 1.into()).await, Err(NodeError::NotJoined)));
        assert!(matches!(n.convergence().await, Err(NodeError::NotJoined)));
        let status = n.status().await;
        assert_eq!(status.network_id, None);
    }

    #[tokio::test]
    async fn test_heartbeat_is_echoed() {
        let transport = LocalTransport::new();
        let n = node(config("a"), &transport, Arc::new(MemoryStorage::new()));
        let resp = n
            .handle_message(GossipMessage::Heartbeat { sender: "b".into(), nonce: 42 })
            .await
            .unwrap();
        assert_eq!(resp.node_id, "a");
        assert_eq!(resp.replies, vec![GossipMessage::Heartbeat { sender: "a".into(), nonce: 42 }]);
    }

    #[tokio::test]
    async fn test_update_outside_replica_is_rejected() {
        let transport = LocalTransport::new();
        let mut nb = NetworkBuilder::new("pair");
        let root = nb.root();
        let left = nb.group(&root, "left");
        let right = nb.group(&root, "right");
        nb.contact(&left, "l", BlendMode::AcceptLast);
        nb.contact(&right, "r", BlendMode::AcceptLast);
        let n = node(config("a"), &transport, Arc::new(MemoryStorage::new()));
        n.join_network(nb.build(), vec!["left".into()]).await.unwrap();

        assert!(matches!(n.update_contact("right:r", 1.into()).await, Err(NodeError::NotReplicated(_))));
        assert!(matches!(
            n.update_contact("nope", 1.into()).await,
            Err(NodeError::Propagation(PropagationError::UnknownContact(_)))
        ));
        // remote updates for it are ignored
        n.handle_message(GossipMessage::Update {
            contact_id: "right:r".into(),
            content: 3.into(),
            origin_node: "b".into(),
            logical_timestamp: 1,
        })
        .await
        .unwrap();
        assert!(matches!(n.content("right:r").await, Ok(None)));
    }

    #[tokio::test]
    async fn test_persisted_content_is_restored_on_join() {
        let transport = LocalTransport::new();
        let storage = Arc::new(MemoryStorage::new());
        let first = node(config("a"), &transport, storage.clone());
        first.join_network(pair_network(), vec!["src".into()]).await.unwrap();
        first.update_contact("src:x", 11.into()).await.unwrap();
        first.shutdown().await;

        let second = node(config("a"), &transport, storage.clone());
        second.join_network(pair_network(), vec!["src".into()]).await.unwrap();
        assert_eq!(second.content("src:x").await.unwrap(), Some(Value::Number(11.0)));
        assert!(storage.load_network_state("pair").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_saves_are_counted() {
        let transport = LocalTransport::new();
        let storage = Arc::new(MemoryStorage::new());
        let cfg = GossipConfig { storage_retries: 2, ..config("a") };
        let n = node(cfg, &transport, storage.clone());
        n.join_network(pair_network(), vec!["root".into()]).await.unwrap();

        storage.set_failing(true);
        n.update_contact("src:x", 1.into()).await.unwrap();
        // x and y both settled, neither could be saved
        assert_eq!(n.status().await.degraded_writes, 2);
        assert_eq!(n.content("dst:y").await.unwrap(), Some(Value::Number(1.0)));
    }

    #[tokio::test]
    async fn test_batch_mode_queues_until_flush() {
        let transport = LocalTransport::new();
        let cfg = GossipConfig {
            scheduler: SchedulerConfig { mode: SchedulerMode::Batch, batch_delay_ms: 60_000, ..Default::default() },
            ..config("a")
        };
        let n = node(cfg, &transport, Arc::new(MemoryStorage::new()));
        n.join_network(pair_network(), vec!["root".into()]).await.unwrap();

        assert_eq!(n.update_contact("src:x", 2.into()).await.unwrap(), None);
        assert_eq!(n.content("dst:y").await.unwrap(), None);
        assert_eq!(n.status().await.pending_writes, 1);

        let reports = n.flush().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(n.content("dst:y").await.unwrap(), Some(Value::Number(2.0)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let transport = LocalTransport::new();
        let n = node(config("a"), &transport, Arc::new(MemoryStorage::new()));
        n.join_network(pair_network(), vec!["src".into()]).await.unwrap();
        n.spawn_background().await;
        n.shutdown().await;
        assert!(matches!(
            n.handle_message(GossipMessage::Heartbeat { sender: "b".into(), nonce: 1 }).await,
            Err(NodeError::ShuttingDown)
        ));
        assert!(matches!(n.update_contact("src:x", 1.into()).await, Err(NodeError::ShuttingDown)));
        assert!(!n.status().await.accepting);
    }
}
