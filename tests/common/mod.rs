#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use seymour_mesh::{
    Comment, Keypair, MemoryNetwork, MemoryStore, NetworkConfig, NetworkController, NetworkParts,
    PeerId, PeerIdentity, RecordStore, SignalHub, transport_channel,
};
use tokio::time::{Instant, sleep};

pub const ROOM: &str = "https://example.com/page";

const WAIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(20);

pub fn fast_config() -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.mesh.reconnect_delay = Duration::from_millis(50);
    config.mesh.maintenance_interval = Duration::from_millis(50);
    config.mesh.rpc_timeout = Duration::from_millis(500);
    config.dht.query_timeout = Duration::from_millis(500);
    config.dht.lookup_timeout = Duration::from_secs(2);
    config.mesh.signaling_retry_delay = Duration::from_millis(20);
    config.mesh.signaling_retry_max_delay = Duration::from_millis(200);
    config.sync.sync_interval = Duration::from_millis(200);
    config
}

pub async fn memory_node(hub: &SignalHub, network: &MemoryNetwork) -> NetworkController {
    memory_node_with(hub, network, fast_config(), Arc::new(MemoryStore::new())).await
}

pub async fn memory_node_with(
    hub: &SignalHub,
    network: &MemoryNetwork,
    config: NetworkConfig,
    store: Arc<dyn RecordStore>,
) -> NetworkController {
    let identity = PeerIdentity::from_keypair(Keypair::generate());
    let (events_tx, events_rx) = transport_channel();
    let transport = network.transport(identity.public_key, events_tx);
    let parts = NetworkParts {
        store,
        signaling: hub.connect().await.expect("hub accepts connections"),
        signaling_connector: Some(Arc::new(hub.clone())),
        transport: Arc::new(transport),
        transport_events: events_rx,
    };
    NetworkController::init(config, identity, parts)
        .await
        .expect("controller starts")
}

/// Poll until `node` holds at least `count` comments in `room`.
pub async fn wait_for_comments(node: &NetworkController, room: &str, count: usize) -> Vec<Comment> {
    let deadline = Instant::now() + WAIT;
    loop {
        let comments = node.comments(room).await.expect("store readable");
        if comments.len() >= count {
            return comments;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {count} comments, have {}",
            comments.len()
        );
        sleep(POLL).await;
    }
}

/// Poll until `node` is connected to exactly `peers` in `room`.
pub async fn wait_for_room_peers(node: &NetworkController, room: &str, peers: &[PeerId]) {
    let mut expected = peers.to_vec();
    expected.sort();
    let deadline = Instant::now() + WAIT;
    loop {
        let mut current = node.room_peers(room).await;
        current.sort();
        if current == expected {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for room peers {expected:?}, have {current:?}");
        sleep(POLL).await;
    }
}

/// Poll until `check` holds for the comment with `id` at `node`.
pub async fn wait_for_comment<F>(node: &NetworkController, room: &str, id: &seymour_mesh::CommentId, check: F) -> Comment
where
    F: Fn(&Comment) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let found = node
            .comments(room)
            .await
            .expect("store readable")
            .into_iter()
            .find(|c| c.id == *id);
        if let Some(comment) = found
            && check(&comment)
        {
            return comment;
        }
        assert!(Instant::now() < deadline, "timed out waiting for comment {id}");
        sleep(POLL).await;
    }
}
