use std::sync::Arc;

use propnet_protocol::*;

fn network() -> NetworkState {
    let mut nb = NetworkBuilder::new("durable");
    let root = nb.root();
    let peak = nb.contact(&root, "peak", BlendMode::Max);
    let seen = nb.contact(&root, "seen", BlendMode::Union);
    nb.wire(&peak, &seen);
    nb.build()
}

fn file_node(dir: &std::path::Path) -> Arc<GossipNode> {
    let config = GossipConfig { node_id: "node0".into(), network_id: "durable".into(), ..Default::default() };
    Arc::new(GossipNode::new(
        config,
        Arc::new(LocalTransport::new()),
        Arc::new(FileStorage::new(dir)),
        Arc::new(PrimitiveRegistry::with_builtins()),
    ))
}

#[tokio::test]
async fn test_content_survives_restart_with_file_storage() {
    let dir = tempfile::tempdir().unwrap();

    let first = file_node(dir.path());
    first.join_network(network(), vec!["root".into()]).await.unwrap();
    first.update_contact("root:peak", 4.into()).await.unwrap();
    first.update_contact("root:peak", 9.into()).await.unwrap();
    first.update_contact("root:peak", 2.into()).await.unwrap();
    first.shutdown().await;

    let second = file_node(dir.path());
    second.join_network(network(), vec!["root".into()]).await.unwrap();
    assert_eq!(second.content("root:peak").await.unwrap(), Some(Value::Number(9.0)));
    assert_eq!(
        second.content("root:seen").await.unwrap(),
        Some(Value::Collection(vec![Value::Number(4.0), Value::Number(9.0)]))
    );
    assert_eq!(second.convergence().await.unwrap().ratio, 1.0);

    // restored content still merges by its blend mode
    second.update_contact("root:peak", 5.into()).await.unwrap();
    assert_eq!(second.content("root:peak").await.unwrap(), Some(Value::Number(9.0)));
}

#[tokio::test]
async fn test_join_persists_description() {
    let dir = tempfile::tempdir().unwrap();
    let node = file_node(dir.path());
    node.join_network(network(), vec!["root".into()]).await.unwrap();

    let storage = FileStorage::new(dir.path());
    storage.initialize().await.unwrap();
    let saved = storage.load_network_state("durable").await.unwrap().unwrap();
    assert_eq!(saved.root_group_id, "root");
    assert!(storage.load_group_state("durable", "root").await.unwrap().is_some());
}

#[tokio::test]
async fn test_invalid_description_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut broken = network();
    broken.root_group_id = "missing".into();
    let node = file_node(dir.path());
    let err = node.join_network(broken, vec!["root".into()]).await.unwrap_err();
    assert!(matches!(err, NodeError::Topology(TopologyError::MissingRoot(_))));
}

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

async fn pair_node(id: &str, peer: &str, transport: &LocalTransport, storage: Arc<MemoryStorage>) -> Arc<GossipNode> {
    let config = GossipConfig {
        node_id: id.into(),
        network_id: "pair".into(),
        public_url: format!("local://{id}"),
        seed_peers: vec![PeerEndpoint::new(peer, format!("local://{peer}"))],
        ..Default::default()
    };
    let node = Arc::new(GossipNode::new(
        config,
        Arc::new(transport.clone()),
        storage,
        Arc::new(PrimitiveRegistry::with_builtins()),
    ));
    transport.register(&format!("local://{id}"), &node).await;
    node
}

#[tokio::test]
async fn test_writes_after_restart_win_over_earlier_ones() {
    let transport = LocalTransport::new();
    let storage0 = Arc::new(MemoryStorage::new());
    let node0 = pair_node("node0", "node1", &transport, storage0.clone()).await;
    let node1 = pair_node("node1", "node0", &transport, Arc::new(MemoryStorage::new())).await;
    node0.join_network(pair_network(), vec!["src".into()]).await.unwrap();
    node1.join_network(pair_network(), vec!["dst".into()]).await.unwrap();

    for value in 1..=5 {
        node0.update_contact("src:x", value.into()).await.unwrap();
    }
    assert_eq!(node1.content("dst:y").await.unwrap(), Some(Value::Number(5.0)));
    let clock_before = node0.status().await.clock;
    node0.shutdown().await;

    let restarted = pair_node("node0", "node1", &transport, storage0).await;
    restarted.join_network(pair_network(), vec!["src".into()]).await.unwrap();
    assert!(restarted.status().await.clock >= clock_before);

    restarted.update_contact("src:x", 42.into()).await.unwrap();
    assert_eq!(node1.content("src:x").await.unwrap(), Some(Value::Number(42.0)));
    assert_eq!(node1.content("dst:y").await.unwrap(), Some(Value::Number(42.0)));

    // the peer's copy of the old value must not roll the new one back
    restarted.sync_round().await.unwrap();
    assert_eq!(restarted.content("src:x").await.unwrap(), Some(Value::Number(42.0)));
    node1.sync_round().await.unwrap();
    assert_eq!(node1.content("dst:y").await.unwrap(), Some(Value::Number(42.0)));
}
