//! How gossip messages reach a peer.
//!
//! `HttpTransport` posts JSON to `{url}/gossip`. `LocalTransport` delivers to
//! handlers registered in the same process and can cut individual endpoints
//! off to simulate a partition.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::types::*;

#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn send(&self, peer: &PeerEndpoint, message: &GossipMessage) -> Result<GossipResponse>;
}

/// Something that answers gossip messages
#[async_trait]
pub trait GossipHandler: Send + Sync {
    async fn handle(&self, message: GossipMessage) -> Result<GossipResponse>;
}

pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl GossipTransport for HttpTransport {
    async fn send(&self, peer: &PeerEndpoint, message: &GossipMessage) -> Result<GossipResponse> {
        let url = format!("{}/gossip", peer.url.trim_end_matches('/'));
        let resp = self.http
            .post(&url)
            .json(message)
            .send()
            .await
            .context("Failed to reach peer")?;

        if !resp.status().is_success() {
            anyhow::bail!("Peer returned HTTP {}", resp.status());
        }

        resp.json().await.context("Failed to parse peer response")
    }
}

#[derive(Default)]
struct Hub {
    handlers: HashMap<String, Weak<dyn GossipHandler>>,
    unreachable: HashSet<String>,
}

/// In-process transport keyed by endpoint url
#[derive(Clone, Default)]
pub struct LocalTransport {
    hub: Arc<RwLock<Hub>>,
    delivered: Arc<AtomicU64>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `url` to `handler`. Only a weak reference is kept.
    pub async fn register<H: GossipHandler + 'static>(&self, url: &str, handler: &Arc<H>) {
        let weak: Weak<dyn GossipHandler> = Arc::downgrade(handler) as Weak<dyn GossipHandler>;
        self.hub.write().await.handlers.insert(url.to_string(), weak);
    }

    /// Cut an endpoint off (or restore it). Sends addressed to it fail; it can
    /// still send to others.
    pub async fn set_reachable(&self, url: &str, reachable: bool) {
        let mut hub = self.hub.write().await;
        if reachable {
            hub.unreachable.remove(url);
        } else {
            hub.unreachable.insert(url.to_string());
        }
    }

    /// Messages delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GossipTransport for LocalTransport {
    async fn send(&self, peer: &PeerEndpoint, message: &GossipMessage) -> Result<GossipResponse> {
        let handler = {
            let hub = self.hub.read().await;
            if hub.unreachable.contains(&peer.url) {
                anyhow::bail!("Peer {} is unreachable", peer.peer_id);
            }
            hub.handlers
                .get(&peer.url)
                .and_then(Weak::upgrade)
                .with_context(|| format!("No handler registered at {}", peer.url))?
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);
        handler.handle(message.clone()).await
    }
}
