//! # Network Controller
//!
//! The entry point for the comment layer. A [`NetworkController`] owns every
//! component and wires them together:
//!
//! ```text
//!            ┌──────────────── NetworkController ────────────────┐
//! signaling ─┤ MeshTransport ──inbound──> dispatcher ─┬─> GossipProtocol
//! transport ─┤     │  ▲                              ├─> CommentSyncEngine
//!            │     │  └──── DhtNode<MeshTransport> <─┘   (dht-request)
//!            │     └──events──> peer lifecycle (DHT routing, initial sync)
//!            └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! let controller = NetworkController::start(NetworkConfig::default()).await?;
//! let mut events = controller.events().await?;
//!
//! controller.join_room("https://example.com/article").await?;
//! controller.post_comment("https://example.com/article", "first!", None, None).await?;
//!
//! while let Some(CommentEvent::Merged { room_id, comments }) = events.recv().await {
//!     println!("{room_id}: {} new or changed", comments.len());
//! }
//! ```
//!
//! Local writes go to the store first and are then gossiped. Storage errors
//! reach the caller; network failures never do.
//!
//! Every posted comment is also published in the DHT under its content id.
//! [`NetworkController::comment`] falls back to that copy for ids the local
//! store has never seen, which is how replies and votes resolve comments
//! from rooms this node has not synced.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::comment::{Comment, CommentDraft, CommentId, normalize_room_id};
use crate::dht::{DhtConfig, DhtNode, comment_key};
use crate::error::NetworkError;
use crate::gossip::{GossipConfig, GossipDelivery, GossipOutcome, GossipProtocol};
use crate::identity::{PeerId, PeerIdentity};
use crate::mesh::{InboundMessage, MeshConfig, MeshEvent, MeshReceivers, MeshTransport, transport_channel};
use crate::messages::{GossipPayload, PeerMessageBody};
use crate::protocols::{PeerSender, PeerTransport, SignalingConnector, TransportEvent};
use crate::signaling::{
    DEFAULT_ATTEMPTS_PER_SERVER, DEFAULT_RETRY_DELAY, SignalServers, SignalingChannel, connect_with_fallback,
};
use crate::storage::{CommentStore, FileStore, MemoryStore, RecordStore};
use crate::sync::{CommentEvent, CommentSyncEngine, SyncConfig};
use crate::transport::{DEFAULT_IDLE_TIMEOUT, QuicTransport};

pub const DEFAULT_SIGNAL_SERVER: &str = "ws://127.0.0.1:8787";

const CUSTOM_DEPTH: usize = 256;

/// A receiver that can be taken exactly once.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Signaling servers, tried in order.
    pub signal_servers: Vec<String>,
    pub signaling_attempts_per_server: usize,
    pub signaling_retry_delay: Duration,
    pub bind_addr: SocketAddr,
    /// Addresses offered to peers; empty means the bound address.
    pub advertise_addrs: Vec<SocketAddr>,
    /// Where identity, comments and DHT records live; `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    pub display_name: Option<String>,
    pub idle_timeout: Duration,
    pub dht: DhtConfig,
    pub mesh: MeshConfig,
    pub gossip: GossipConfig,
    pub sync: SyncConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signal_servers: vec![DEFAULT_SIGNAL_SERVER.to_string()],
            signaling_attempts_per_server: DEFAULT_ATTEMPTS_PER_SERVER,
            signaling_retry_delay: DEFAULT_RETRY_DELAY,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            advertise_addrs: Vec::new(),
            data_dir: None,
            display_name: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            dht: DhtConfig::default(),
            mesh: MeshConfig::default(),
            gossip: GossipConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Everything [`NetworkController::init`] needs besides configuration and
/// identity. The transport must already be sending its events to
/// `transport_events`.
pub struct NetworkParts {
    pub store: Arc<dyn RecordStore>,
    pub signaling: SignalingChannel,
    /// Replaces `signaling` if it drops; `None` leaves the node without
    /// signaling after a loss.
    pub signaling_connector: Option<Arc<dyn SignalingConnector>>,
    pub transport: Arc<dyn PeerTransport>,
    pub transport_events: mpsc::Receiver<TransportEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkStats {
    pub peer_id: PeerId,
    pub connected_peers: usize,
    pub messages_gossiped: u64,
    pub messages_relayed: u64,
    pub duplicates_dropped: u64,
    pub verification_failures: u64,
    pub comments_stored: usize,
    pub routing_table_size: usize,
    pub dht_records: usize,
}

/// An application message from a collaborator built on the mesh.
#[derive(Clone, Debug)]
pub struct CustomMessage {
    pub from: PeerId,
    pub kind: String,
    pub data: Value,
}

pub struct NetworkController {
    identity: PeerIdentity,
    display_name: Option<String>,
    store: CommentStore,
    mesh: MeshTransport,
    dht: DhtNode<MeshTransport>,
    gossip: GossipProtocol,
    sync: CommentSyncEngine,
    comment_events: TakeOnce<CommentEvent>,
    custom_messages: TakeOnce<CustomMessage>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkController {
    /// Production wiring: file or memory store, persisted identity,
    /// WebSocket signaling with fallback and a QUIC transport.
    pub async fn start(config: NetworkConfig) -> Result<Self> {
        let store: Arc<dyn RecordStore> = match &config.data_dir {
            Some(dir) => Arc::new(
                FileStore::open(dir)
                    .await
                    .map_err(NetworkError::from)
                    .with_context(|| format!("failed to open data directory {}", dir.display()))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        let identity = PeerIdentity::generate_or_load(store.as_ref()).await?;
        info!(peer = %identity.id, "identity ready");

        let (server, signaling) = connect_with_fallback(
            &config.signal_servers,
            config.signaling_attempts_per_server,
            config.signaling_retry_delay,
            config.mesh.signaling_timeout,
        )
        .await?;

        let (events_tx, events_rx) = transport_channel();
        let transport = QuicTransport::bind(
            identity.keypair(),
            config.bind_addr,
            config.advertise_addrs.clone(),
            events_tx,
            config.idle_timeout,
        )?;
        info!(
            signaling = %server,
            addrs = ?transport.advertised_addrs(),
            "network transport ready"
        );

        let connector = SignalServers {
            urls: config.signal_servers.clone(),
            attempts_per_server: config.signaling_attempts_per_server,
            retry_delay: config.signaling_retry_delay,
            timeout: config.mesh.signaling_timeout,
        };
        let parts = NetworkParts {
            store,
            signaling,
            signaling_connector: Some(Arc::new(connector)),
            transport: Arc::new(transport),
            transport_events: events_rx,
        };
        Self::init(config, identity, parts).await
    }

    /// Wire the components over caller-provided parts.
    pub async fn init(config: NetworkConfig, identity: PeerIdentity, parts: NetworkParts) -> Result<Self> {
        let store = CommentStore::new(parts.store.clone());

        let (mesh, MeshReceivers { events, inbound }) = match parts.signaling_connector {
            Some(connector) => MeshTransport::with_reconnect(
                identity.clone(),
                parts.signaling,
                connector,
                parts.transport,
                parts.transport_events,
                config.mesh.clone(),
            ),
            None => MeshTransport::new(
                identity.clone(),
                parts.signaling,
                parts.transport,
                parts.transport_events,
                config.mesh.clone(),
            ),
        };
        let dht = DhtNode::new(identity.id, mesh.clone(), config.dht.clone(), Some(parts.store));
        let restored = dht.load_records().await?;
        let (gossip, deliveries) = GossipProtocol::new(identity.id, mesh.clone(), config.gossip.clone());
        let (sync, comment_events) = CommentSyncEngine::new(store.clone(), mesh.clone(), config.sync.clone());
        let (custom_tx, custom_rx) = mpsc::channel(CUSTOM_DEPTH);

        let dispatcher = Dispatcher {
            store: store.clone(),
            mesh: mesh.clone(),
            dht: dht.clone(),
            gossip: gossip.clone(),
            sync: sync.clone(),
            custom_tx,
        };
        let tasks = vec![
            tokio::spawn(dispatcher.clone().run_inbound(inbound)),
            tokio::spawn(dispatcher.clone().run_mesh_events(events)),
            tokio::spawn(dispatcher.run_deliveries(deliveries)),
        ];

        info!(peer = %identity.id, dht_records = restored, "network controller started");

        Ok(Self {
            identity,
            display_name: config.display_name,
            store,
            mesh,
            dht,
            gossip,
            sync,
            comment_events: Mutex::new(Some(comment_events)),
            custom_messages: Mutex::new(Some(custom_rx)),
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Join the room for `url`: connect to its members, start syncing it and
    /// announce ourselves in the DHT. Returns the members offered to.
    pub async fn join_room(&self, url: &str) -> Result<Vec<PeerId>> {
        let room = normalize_room_id(url);
        let peers = self.mesh.join_room(&room).await?;
        self.sync.join_room(&room).await;

        let dht = self.dht.clone();
        let announced_room = room.clone();
        tokio::spawn(async move {
            match dht.announce_room(&announced_room).await {
                Ok(acks) => debug!(room = %announced_room, acks, "announced room in dht"),
                Err(err) => debug!(room = %announced_room, error = %err, "room announcement failed"),
            }
        });

        Ok(peers)
    }

    pub async fn leave_room(&self, url: &str) {
        let room = normalize_room_id(url);
        self.sync.leave_room(&room).await;
        self.mesh.leave_room(&room).await;
    }

    /// Peers the DHT roster lists for `url`, whether or not we are connected
    /// to them.
    pub async fn discover_room_peers(&self, url: &str) -> Result<Vec<PeerId>> {
        self.dht.lookup_room(&normalize_room_id(url)).await
    }

    /// Sign, store and gossip a new comment.
    pub async fn post_comment(
        &self,
        url: &str,
        text: &str,
        selected_quote: Option<String>,
        reply_to: Option<CommentId>,
    ) -> Result<Comment> {
        let room = normalize_room_id(url);
        if let Some(parent) = &reply_to {
            let parent = self.load(parent).await?;
            if parent.room_id != room {
                bail!("comment {} belongs to another room", parent.id);
            }
        }
        let draft = CommentDraft {
            room_id: room.clone(),
            text: text.to_string(),
            display_name: self.display_name.clone(),
            selected_quote,
            reply_to,
        };
        let comment = Comment::create(self.identity.keypair(), draft)?;
        self.sync.ingest(&room, vec![comment.clone()]).await?;

        self.publish(GossipPayload::NewComment {
            comment: comment.clone(),
        })
        .await?;

        let value = serde_json::to_vec(&comment)?;
        let dht = self.dht.clone();
        let id = comment.id;
        tokio::spawn(async move {
            match dht.store(&comment_key(&id), value).await {
                Ok(acks) => debug!(comment = %id, acks, "published comment in dht"),
                Err(err) => debug!(comment = %id, error = %err, "comment publication failed"),
            }
        });
        info!(comment = %comment.id, room = %room, "comment posted");
        Ok(comment)
    }

    /// Upvote a stored comment. Voting twice changes nothing.
    pub async fn vote(&self, comment_id: &CommentId) -> Result<Comment> {
        let mut comment = self.load(comment_id).await?;
        let vote = comment.vote(self.identity.keypair())?;
        if !comment.apply_vote(vote.clone()) {
            return Ok(comment);
        }
        self.sync.ingest(&comment.room_id, vec![comment.clone()]).await?;
        self.publish(GossipPayload::CommentVote { vote }).await?;
        self.load(comment_id).await
    }

    /// Tombstone one of our own comments.
    pub async fn delete_comment(&self, comment_id: &CommentId) -> Result<Comment> {
        let mut comment = self.load(comment_id).await?;
        let deletion = comment.delete(self.identity.keypair())?;
        if !comment.apply_deletion(deletion.clone()) {
            return Ok(comment);
        }
        self.sync.ingest(&comment.room_id, vec![comment.clone()]).await?;
        self.publish(GossipPayload::CommentDelete { deletion }).await?;
        self.load(comment_id).await
    }

    /// Every stored comment of the room, oldest first, tombstoned ones
    /// included.
    pub async fn comments(&self, url: &str) -> Result<Vec<Comment>> {
        self.store.room_comments(&normalize_room_id(url)).await
    }

    pub async fn room_peers(&self, url: &str) -> Vec<PeerId> {
        self.mesh.room_peers(&normalize_room_id(url)).await
    }

    pub async fn send_custom(&self, peer: &PeerId, kind: &str, data: Value) -> bool {
        let body = PeerMessageBody::Custom {
            kind: kind.to_string(),
            data,
        };
        self.mesh.send_to_peer(peer, body).await
    }

    pub async fn get_stats(&self) -> Result<NetworkStats> {
        let mesh = self.mesh.stats().await;
        let gossip = self.gossip.stats().await;
        let dht = self.dht.stats().await;
        Ok(NetworkStats {
            peer_id: self.identity.id,
            connected_peers: mesh.connected,
            messages_gossiped: gossip.messages_gossiped,
            messages_relayed: gossip.messages_relayed,
            duplicates_dropped: gossip.duplicates,
            verification_failures: mesh.verification_failures,
            comments_stored: self.store.count().await?,
            routing_table_size: dht.routing_table_size,
            dht_records: dht.records,
        })
    }

    /// The UI event stream. Can be taken once.
    pub async fn events(&self) -> Result<mpsc::Receiver<CommentEvent>> {
        self.comment_events
            .lock()
            .await
            .take()
            .context("comment event receiver already taken")
    }

    pub async fn custom_messages(&self) -> Result<mpsc::Receiver<CustomMessage>> {
        self.custom_messages
            .lock()
            .await
            .take()
            .context("custom message receiver already taken")
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }

        self.mesh.shutdown().await;
        self.gossip.quit().await;
        self.sync.quit().await;
        self.dht.quit().await;
        info!(peer = %self.identity.id, "network controller stopped");
    }

    /// A comment by id: the local store first, then the copy published in
    /// the DHT. A fetched copy is verified and merged into the store.
    pub async fn comment(&self, comment_id: &CommentId) -> Result<Option<Comment>> {
        if let Some(comment) = self.store.get(comment_id).await? {
            return Ok(Some(comment));
        }
        let Some(bytes) = self.dht.retrieve(&comment_key(comment_id)).await? else {
            return Ok(None);
        };
        let comment: Comment = match serde_json::from_slice(&bytes) {
            Ok(comment) => comment,
            Err(err) => {
                warn!(comment = %comment_id, error = %err, "undecodable comment in dht");
                return Ok(None);
            }
        };
        if comment.id != *comment_id {
            warn!(comment = %comment_id, found = %comment.id, "dht returned a different comment");
            return Ok(None);
        }
        if let Err(err) = comment.verify() {
            warn!(comment = %comment_id, error = %err, "dropping unverifiable comment from dht");
            return Ok(None);
        }
        let room = comment.room_id.clone();
        self.sync.ingest(&room, vec![comment]).await?;
        debug!(comment = %comment_id, room = %room, "comment fetched from dht");
        self.store.get(comment_id).await
    }

    async fn load(&self, comment_id: &CommentId) -> Result<Comment> {
        self.comment(comment_id)
            .await?
            .ok_or_else(|| anyhow!("unknown comment {comment_id}"))
    }

    async fn publish(&self, payload: GossipPayload) -> Result<()> {
        match self.gossip.gossip(payload).await? {
            GossipOutcome::Published { message_id, sent } => {
                debug!(message = %message_id, sent, "gossip sent");
            }
            other => trace!(?other, "gossip not sent"),
        }
        Ok(())
    }
}

/// Routes mesh traffic to the component that owns it.
#[derive(Clone)]
struct Dispatcher {
    store: CommentStore,
    mesh: MeshTransport,
    dht: DhtNode<MeshTransport>,
    gossip: GossipProtocol,
    sync: CommentSyncEngine,
    custom_tx: mpsc::Sender<CustomMessage>,
}

impl Dispatcher {
    async fn run_inbound(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(InboundMessage { from, message }) = inbound.recv().await {
            self.dispatch(from, message.body).await;
        }
        debug!("inbound dispatcher stopped");
    }

    async fn dispatch(&self, from: PeerId, body: PeerMessageBody) {
        match body {
            PeerMessageBody::SyncRequest { room_id, since } => {
                self.sync.handle_sync_request(from, room_id, since).await;
            }
            PeerMessageBody::SyncResponse { room_id, comments, more } => {
                if let Err(err) = self.sync.handle_sync_response(from, room_id, comments, more).await {
                    warn!(peer = %from, error = %err, "failed to apply sync response");
                }
            }
            PeerMessageBody::NewComment { comment } => {
                if let Err(err) = self.sync.handle_pushed(from, comment).await {
                    warn!(peer = %from, error = %err, "failed to store pushed comment");
                }
            }
            PeerMessageBody::Gossip { envelope } => {
                let outcome = self.gossip.handle_gossip(from, envelope).await;
                trace!(peer = %from, ?outcome, "gossip handled");
            }
            PeerMessageBody::GossipAck { message_id } => {
                self.gossip.handle_ack(from, message_id).await;
            }
            PeerMessageBody::DhtRequest { request_id, request } => {
                let response = self.dht.handle_request(&from, request).await;
                let body = PeerMessageBody::DhtResponse { request_id, response };
                if !self.mesh.send_to_peer(&from, body).await {
                    debug!(peer = %from, request_id, "could not answer dht request");
                }
            }
            PeerMessageBody::Custom { kind, data } => {
                if self.custom_tx.try_send(CustomMessage { from, kind, data }).is_err() {
                    debug!(peer = %from, "custom message dropped");
                }
            }
            PeerMessageBody::DhtResponse { .. } | PeerMessageBody::Unknown => {
                trace!(peer = %from, "ignoring message");
            }
        }
    }

    async fn run_mesh_events(self, mut events: mpsc::Receiver<MeshEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                MeshEvent::PeerConnected { peer } => {
                    self.dht.observe_peer(peer).await;
                    self.sync.peer_connected(peer).await;
                }
                MeshEvent::PeerDisconnected { peer } => {
                    debug!(peer = %peer, "peer disconnected");
                }
                MeshEvent::PeerUnreachable { peer, error } => {
                    info!(peer = %peer, error = %error, "giving up on peer");
                    self.dht.remove_peer(&peer).await;
                }
            }
        }
        debug!("mesh event loop stopped");
    }

    async fn run_deliveries(self, mut deliveries: mpsc::Receiver<GossipDelivery>) {
        while let Some(delivery) = deliveries.recv().await {
            if let Err(err) = self.apply(delivery).await {
                warn!(error = %err, "failed to apply gossip payload");
            }
        }
        debug!("gossip delivery loop stopped");
    }

    /// Votes and deletions only apply to comments we already hold; sync
    /// carries them along with the comment otherwise.
    async fn apply(&self, delivery: GossipDelivery) -> Result<()> {
        let GossipDelivery { from, payload, .. } = delivery;
        match payload {
            GossipPayload::NewComment { comment } => {
                self.sync.handle_pushed(from, comment).await?;
            }
            GossipPayload::CommentVote { vote } => {
                let Some(mut comment) = self.store.get(&vote.comment_id).await? else {
                    trace!(comment = %vote.comment_id, "vote for unknown comment");
                    return Ok(());
                };
                if comment.apply_vote(vote) {
                    self.sync.ingest(&comment.room_id.clone(), vec![comment]).await?;
                }
            }
            GossipPayload::CommentDelete { deletion } => {
                let Some(mut comment) = self.store.get(&deletion.comment_id).await? else {
                    trace!(comment = %deletion.comment_id, "deletion for unknown comment");
                    return Ok(());
                };
                if comment.apply_deletion(deletion) {
                    self.sync.ingest(&comment.room_id.clone(), vec![comment]).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::signaling::SignalHub;
    use crate::transport::MemoryNetwork;

    async fn controller(hub: &SignalHub, network: &MemoryNetwork) -> NetworkController {
        let identity = PeerIdentity::from_keypair(Keypair::generate());
        let (events_tx, events_rx) = transport_channel();
        let transport = network.transport(identity.public_key, events_tx);
        let parts = NetworkParts {
            store: Arc::new(MemoryStore::new()),
            signaling: hub.connect().await.unwrap(),
            signaling_connector: None,
            transport: Arc::new(transport),
            transport_events: events_rx,
        };
        NetworkController::init(NetworkConfig::default(), identity, parts)
            .await
            .unwrap()
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = NetworkConfig::default();
        assert_eq!(config.signal_servers, vec![DEFAULT_SIGNAL_SERVER.to_string()]);
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.gossip.fanout, 6);
        assert_eq!(config.gossip.ttl_max, 3);
        assert_eq!(config.sync.sync_interval, Duration::from_secs(30));
        assert_eq!(config.mesh.max_peers_per_room, 50);
        assert_eq!(config.mesh.reconnect_attempts, 3);
        assert!(config.data_dir.is_none());
    }

    #[tokio::test]
    async fn local_post_is_stored_and_announced() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let node = controller(&hub, &network).await;
        let mut events = node.events().await.unwrap();
        assert!(node.events().await.is_err());

        node.join_room("https://example.com/page/").await.unwrap();
        let comment = node
            .post_comment("https://example.com/page?utm=1", "hello", Some("quote".into()), None)
            .await
            .unwrap();
        assert_eq!(comment.room_id, "https://example.com/page");

        let CommentEvent::Merged { room_id, comments } = events.recv().await.unwrap();
        assert_eq!(room_id, "https://example.com/page");
        assert_eq!(comments, vec![comment.clone()]);

        assert_eq!(node.comments("https://example.com/page").await.unwrap(), vec![comment]);
        let stats = node.get_stats().await.unwrap();
        assert_eq!(stats.comments_stored, 1);
        assert_eq!(stats.messages_gossiped, 1);
        assert_eq!(stats.connected_peers, 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn votes_are_per_voter_and_only_authors_delete() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let node = controller(&hub, &network).await;
        node.join_room("https://example.com/a").await.unwrap();

        let comment = node.post_comment("https://example.com/a", "vote", None, None).await.unwrap();
        assert_eq!(node.vote(&comment.id).await.unwrap().upvotes(), 1);
        assert_eq!(node.vote(&comment.id).await.unwrap().upvotes(), 1);

        assert!(node.delete_comment(&comment.id).await.unwrap().is_deleted());

        let unknown = CommentId::from_bytes([7u8; 32]);
        assert!(node.vote(&unknown).await.is_err());
        node.shutdown().await;
    }
}
