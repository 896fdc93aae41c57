use chrono::{DateTime, Utc};
use std::sync::Arc;

use propnet_protocol::GossipNode;

pub struct AppState {
    pub node: Arc<GossipNode>,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(node: Arc<GossipNode>) -> Arc<Self> {
        Arc::new(Self { node, start_time: Utc::now() })
    }

    pub fn uptime_secs(&self) -> i64 {
        Utc::now().signed_duration_since(self.start_time).num_seconds()
    }
}
