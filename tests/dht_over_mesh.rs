//! DHT requests carried over mesh channels.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ROOM, memory_node, wait_for_room_peers};
use seymour_mesh::{
    DhtConfig, DhtNode, InboundMessage, Keypair, LookupState, MemoryNetwork, MeshConfig, MeshEvent, MeshTransport,
    PeerId, PeerIdentity, PeerMessageBody, PeerSender, SignalHub, transport_channel,
};
use tokio::time::timeout;

struct DhtPeer {
    id: PeerId,
    mesh: MeshTransport,
    dht: DhtNode<MeshTransport>,
    events: tokio::sync::mpsc::Receiver<MeshEvent>,
}

/// A mesh plus DHT node, answering DHT requests the way the controller does.
async fn dht_peer(hub: &SignalHub, network: &MemoryNetwork) -> DhtPeer {
    let identity = PeerIdentity::from_keypair(Keypair::generate());
    let (events_tx, events_rx) = transport_channel();
    let transport = network.transport(identity.public_key, events_tx);
    let config = MeshConfig {
        rpc_timeout: Duration::from_millis(500),
        ..MeshConfig::default()
    };
    let (mesh, receivers) = MeshTransport::new(
        identity.clone(),
        hub.connect().await.unwrap(),
        Arc::new(transport),
        events_rx,
        config,
    );
    let dht_config = DhtConfig {
        query_timeout: Duration::from_millis(500),
        lookup_timeout: Duration::from_secs(2),
        ..DhtConfig::default()
    };
    let dht = DhtNode::new(identity.id, mesh.clone(), dht_config, None);

    let responder_mesh = mesh.clone();
    let responder_dht = dht.clone();
    let mut inbound = receivers.inbound;
    tokio::spawn(async move {
        while let Some(InboundMessage { from, message }) = inbound.recv().await {
            if let PeerMessageBody::DhtRequest { request_id, request } = message.body {
                let response = responder_dht.handle_request(&from, request).await;
                responder_mesh
                    .send_to_peer(&from, PeerMessageBody::DhtResponse { request_id, response })
                    .await;
            }
        }
    });

    DhtPeer {
        id: identity.id,
        mesh,
        dht,
        events: receivers.events,
    }
}

async fn wait_connected(peer: &mut DhtPeer, count: usize) {
    let mut connected = 0;
    while connected < count {
        match timeout(Duration::from_secs(5), peer.events.recv()).await.unwrap() {
            Some(MeshEvent::PeerConnected { peer: other }) => {
                peer.dht.observe_peer(other).await;
                connected += 1;
            }
            Some(_) => {}
            None => panic!("mesh stopped"),
        }
    }
}

#[tokio::test]
async fn store_with_nobody_reachable_is_local_only() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let lone = dht_peer(&hub, &network).await;

    let acks = lone.dht.store(b"room:lonely", b"value".to_vec()).await.unwrap();
    assert_eq!(acks, 0);
    assert_eq!(lone.dht.retrieve(b"room:lonely").await.unwrap(), Some(b"value".to_vec()));
    assert_eq!(lone.dht.stats().await.records, 1);
}

#[tokio::test]
async fn records_replicate_and_lookups_converge_over_the_mesh() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let mut a = dht_peer(&hub, &network).await;
    let mut b = dht_peer(&hub, &network).await;
    let mut c = dht_peer(&hub, &network).await;

    a.mesh.join_room(ROOM).await.unwrap();
    b.mesh.join_room(ROOM).await.unwrap();
    c.mesh.join_room(ROOM).await.unwrap();
    wait_connected(&mut a, 2).await;
    wait_connected(&mut b, 2).await;
    wait_connected(&mut c, 2).await;

    let acks = a.dht.store(b"shared-key", b"shared-value".to_vec()).await.unwrap();
    assert_eq!(acks, 2);
    assert_eq!(c.dht.retrieve(b"shared-key").await.unwrap(), Some(b"shared-value".to_vec()));

    let target = Keypair::generate().peer_id();
    let lookup = b.dht.find_node(target).await.unwrap();
    assert_eq!(lookup.state, LookupState::Converged);
    let mut found = lookup.closest.clone();
    found.sort();
    let mut expected = vec![a.id, c.id];
    expected.sort();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn room_rosters_are_discoverable() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;
    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&x, ROOM, &[y.peer_id()]).await;

    // Announcements race the connection; joining again re-announces.
    x.join_room(ROOM).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let peers = y.discover_room_peers(ROOM).await.unwrap();
        assert!(!peers.contains(&y.peer_id()));
        if peers.contains(&x.peer_id()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "x never showed up in the roster");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(y.get_stats().await.unwrap().routing_table_size >= 1);

    // The earlier member must learn about the later one as well.
    y.join_room(ROOM).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let peers = x.discover_room_peers(ROOM).await.unwrap();
        if peers.contains(&y.peer_id()) {
            assert!(!peers.contains(&x.peer_id()));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "y never showed up in x's roster");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(y.discover_room_peers(ROOM).await.unwrap().contains(&x.peer_id()));

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn comments_resolve_through_the_dht_outside_synced_rooms() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;
    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&x, ROOM, &[y.peer_id()]).await;

    // y never joins this room, so neither gossip nor sync brings it the comment.
    let elsewhere = "https://example.com/elsewhere";
    let parent = x.post_comment(elsewhere, "published by id", None, None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let reply = loop {
        match y.post_comment(elsewhere, "answering", None, Some(parent.id)).await {
            Ok(reply) => break reply,
            Err(err) => {
                assert!(tokio::time::Instant::now() < deadline, "parent never resolved: {err:#}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };
    assert_eq!(reply.reply_to, Some(parent.id));

    let fetched = y.comment(&parent.id).await.unwrap().unwrap();
    assert_eq!(fetched.text, "published by id");
    assert_eq!(fetched.author, x.peer_id());
    let mut ids: Vec<_> = y.comments(elsewhere).await.unwrap().into_iter().map(|c| c.id).collect();
    ids.sort();
    let mut expected = vec![parent.id, reply.id];
    expected.sort();
    assert_eq!(ids, expected);

    let unknown = Keypair::generate();
    let stranger = seymour_mesh::Comment::create(
        &unknown,
        seymour_mesh::CommentDraft {
            room_id: elsewhere.into(),
            text: "never published".into(),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(y.comment(&stranger.id).await.unwrap().is_none());
    assert!(y.post_comment(elsewhere, "orphan", None, Some(stranger.id)).await.is_err());

    x.shutdown().await;
    y.shutdown().await;
}
