//! # Mesh Transport
//!
//! Maintains direct, authenticated channels to the other members of every
//! joined room.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Connecting ──(channel open)──> Connected ──(teardown/failure)──> Closed
//!     │
//!     └──(negotiation timeout / dial failure)──> Failed
//! ```
//!
//! The peer that joins a room later initiates (offers) to everyone already
//! present; earlier members wait for the offer. When a channel fails, only
//! the initiator retries, `reconnect_attempts` times `reconnect_delay` apart,
//! before reporting the peer unreachable for the rest of the session.
//!
//! ## Signaling Loss
//!
//! Open channels survive a lost signaling session. When a
//! [`SignalingConnector`] is configured the actor reconnects in the
//! background, backing off exponentially from `signaling_retry_delay` up to
//! `signaling_retry_max_delay`, then re-joins every joined room.
//!
//! ## Message Integrity
//!
//! Every frame is a signed [`PeerMessage`]. A frame is accepted only when its
//! `sender` is the channel's authenticated peer and the signature verifies
//! against that peer's key. Everything else is dropped and counted.
//!
//! ## Actor Architecture
//!
//! - `MeshTransport`: cloneable handle, implements [`PeerSender`] and [`DhtRpc`]
//! - `MeshActor`: owns every [`PeerConnection`], the signaling session and the
//!   transport event queue
//!
//! Inbound bodies go out on a bounded queue with `try_send`, so a slow
//! consumer drops messages instead of stalling the actor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::dht::Key;
use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity, PublicKey};
use crate::messages::{
    DhtRequest, DhtResponse, PeerMessage, PeerMessageBody, RosterEntry, SessionDescription,
    SignalMessage,
};
use crate::protocols::{DhtRpc, PeerSender, PeerTransport, SignalingConnector, TransportEvent, TransportEvents};
use crate::signaling::{DEFAULT_MAX_RETRY_DELAY, DEFAULT_RETRY_DELAY, SignalingChannel, next_backoff};

pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 50;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

const TRANSPORT_EVENT_DEPTH: usize = 1024;
const INBOUND_DEPTH: usize = 1024;
const EVENT_DEPTH: usize = 256;

#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub max_peers_per_room: usize,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub negotiation_timeout: Duration,
    /// How long `join_room` waits for the roster.
    pub signaling_timeout: Duration,
    pub maintenance_interval: Duration,
    /// How long a DHT request waits for its response.
    pub rpc_timeout: Duration,
    /// First pause before replacing a lost signaling session.
    pub signaling_retry_delay: Duration,
    pub signaling_retry_max_delay: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: DEFAULT_MAX_PEERS_PER_ROOM,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            signaling_timeout: DEFAULT_SIGNALING_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            signaling_retry_delay: DEFAULT_RETRY_DELAY,
            signaling_retry_max_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

/// Event queue pair to hand to a [`PeerTransport`] and then to the mesh.
pub fn transport_channel() -> (TransportEvents, mpsc::Receiver<TransportEvent>) {
    mpsc::channel(TRANSPORT_EVENT_DEPTH)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Clone, Debug)]
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub state: ConnectionState,
    pub role: Role,
    /// Milliseconds since the Unix epoch of the last sync request sent.
    pub last_sync: u64,
    /// Reconnects used since the channel was last up.
    pub attempts: u32,
    pub since: Instant,
}

#[derive(Debug)]
pub enum MeshEvent {
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    /// Reconnects are exhausted; the peer is skipped for the session.
    PeerUnreachable { peer: PeerId, error: NetworkError },
}

/// A verified message from a connected peer.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub from: PeerId,
    pub message: PeerMessage,
}

pub struct MeshReceivers {
    pub events: mpsc::Receiver<MeshEvent>,
    pub inbound: mpsc::Receiver<InboundMessage>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub connected: usize,
    pub connecting: usize,
    pub verification_failures: u64,
    /// DHT requests still waiting for a response.
    pub pending_requests: usize,
}

enum Command {
    JoinRoom(String, oneshot::Sender<Vec<PeerId>>),
    CancelJoin(String),
    LeaveRoom(String),
    Send(PeerId, PeerMessageBody, oneshot::Sender<bool>),
    Broadcast(PeerMessageBody, Vec<PeerId>, oneshot::Sender<usize>),
    Request(PeerId, DhtRequest, oneshot::Sender<DhtResponse>, oneshot::Sender<Option<u64>>),
    CancelRequest(u64),
    Reconnect(PeerId),
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    RoomPeers(String, oneshot::Sender<Vec<PeerId>>),
    Peer(PeerId, oneshot::Sender<Option<PeerConnection>>),
    SetLastSync(PeerId, u64),
    SignalingRestored(SignalingChannel),
    Stats(oneshot::Sender<MeshStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct MeshTransport {
    cmd_tx: mpsc::Sender<Command>,
    local_id: PeerId,
    config: MeshConfig,
}

struct MeshActor {
    identity: PeerIdentity,
    config: MeshConfig,
    transport: Arc<dyn PeerTransport>,
    signal_tx: mpsc::Sender<SignalMessage>,
    connector: Option<Arc<dyn SignalingConnector>>,
    cmd_tx: mpsc::WeakSender<Command>,
    peers: HashMap<PeerId, PeerConnection>,
    joined_rooms: HashSet<String>,
    room_members: HashMap<String, HashSet<PeerId>>,
    pending_joins: HashMap<String, oneshot::Sender<Vec<PeerId>>>,
    pending_requests: HashMap<u64, (PeerId, oneshot::Sender<DhtResponse>)>,
    next_request_id: u64,
    unreachable: HashSet<PeerId>,
    events_tx: mpsc::Sender<MeshEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    verification_failures: u64,
}

impl MeshTransport {
    pub fn new(
        identity: PeerIdentity,
        signaling: SignalingChannel,
        transport: Arc<dyn PeerTransport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        config: MeshConfig,
    ) -> (Self, MeshReceivers) {
        Self::spawn(identity, signaling, None, transport, transport_events, config)
    }

    /// Like [`MeshTransport::new`], replacing the signaling session through
    /// `connector` whenever it is lost.
    pub fn with_reconnect(
        identity: PeerIdentity,
        signaling: SignalingChannel,
        connector: Arc<dyn SignalingConnector>,
        transport: Arc<dyn PeerTransport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        config: MeshConfig,
    ) -> (Self, MeshReceivers) {
        Self::spawn(identity, signaling, Some(connector), transport, transport_events, config)
    }

    fn spawn(
        identity: PeerIdentity,
        signaling: SignalingChannel,
        connector: Option<Arc<dyn SignalingConnector>>,
        transport: Arc<dyn PeerTransport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        config: MeshConfig,
    ) -> (Self, MeshReceivers) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(EVENT_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        let local_id = identity.id;

        let SignalingChannel {
            tx: signal_tx,
            rx: signal_rx,
        } = signaling;

        let actor = MeshActor {
            identity,
            config: config.clone(),
            transport,
            signal_tx,
            connector,
            cmd_tx: cmd_tx.downgrade(),
            peers: HashMap::new(),
            joined_rooms: HashSet::new(),
            room_members: HashMap::new(),
            pending_joins: HashMap::new(),
            pending_requests: HashMap::new(),
            next_request_id: 1,
            unreachable: HashSet::new(),
            events_tx,
            inbound_tx,
            verification_failures: 0,
        };
        tokio::spawn(actor.run(cmd_rx, signal_rx, transport_events));

        (
            Self {
                cmd_tx,
                local_id,
                config,
            },
            MeshReceivers {
                events: events_rx,
                inbound: inbound_rx,
            },
        )
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Announce ourselves in `room_id` and offer channels to the members
    /// already there. Returns the peers offered to.
    pub async fn join_room(&self, room_id: &str) -> Result<Vec<PeerId>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::JoinRoom(room_id.to_string(), tx))
            .await
            .map_err(|_| anyhow!("mesh stopped"))?;

        match tokio::time::timeout(self.config.signaling_timeout, rx).await {
            Ok(Ok(peers)) => Ok(peers),
            Ok(Err(_)) => Err(NetworkError::SignalingConnection {
                attempts: 1,
                last_error: "signaling session closed".into(),
            }
            .into()),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::CancelJoin(room_id.to_string())).await;
                Err(NetworkError::SignalingConnection {
                    attempts: 1,
                    last_error: format!(
                        "no roster for {room_id} within {}ms",
                        self.config.signaling_timeout.as_millis()
                    ),
                }
                .into())
            }
        }
    }

    pub async fn leave_room(&self, room_id: &str) {
        let _ = self.cmd_tx.send(Command::LeaveRoom(room_id.to_string())).await;
    }

    /// Sign `body` once and send it to every connected peer not in
    /// `exclude`. Returns how many peers it was queued for.
    pub async fn broadcast(&self, body: PeerMessageBody, exclude: &[PeerId]) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Broadcast(body, exclude.to_vec(), tx))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Connected peers that share `room_id` with us.
    pub async fn room_peers(&self, room_id: &str) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RoomPeers(room_id.to_string(), tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn peer(&self, peer: &PeerId) -> Option<PeerConnection> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Peer(*peer, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn stats(&self) -> MeshStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).await.is_err() {
            return MeshStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Send a DHT request over the channel to `peer` and wait for the
    /// correlated response.
    pub async fn request(&self, peer: &PeerId, request: DhtRequest) -> Result<DhtResponse> {
        let (response_tx, response_rx) = oneshot::channel();
        let (sent_tx, sent_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request(*peer, request, response_tx, sent_tx))
            .await
            .map_err(|_| anyhow!("mesh stopped"))?;

        let Some(request_id) = sent_rx.await.map_err(|_| anyhow!("mesh stopped"))? else {
            bail!("no open channel to {peer}");
        };

        match tokio::time::timeout(self.config.rpc_timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => bail!("channel to {peer} closed before responding"),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::CancelRequest(request_id)).await;
                bail!("request to {peer} timed out")
            }
        }
    }

    /// Leave every room, close every channel and stop the actor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl PeerSender for MeshTransport {
    async fn send_to_peer(&self, peer: &PeerId, body: PeerMessageBody) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Send(*peer, body, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ConnectedPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn last_sync(&self, peer: &PeerId) -> Option<u64> {
        self.peer(peer).await.map(|p| p.last_sync)
    }

    async fn set_last_sync(&self, peer: &PeerId, at_ms: u64) {
        let _ = self.cmd_tx.send(Command::SetLastSync(*peer, at_ms)).await;
    }
}

fn unexpected(response: DhtResponse) -> anyhow::Error {
    match response {
        DhtResponse::Error { message } => anyhow!("remote error: {message}"),
        other => anyhow!("unexpected response {other:?}"),
    }
}

#[async_trait]
impl DhtRpc for MeshTransport {
    async fn find_node(&self, to: &PeerId, target: PeerId) -> Result<Vec<PeerId>> {
        match self.request(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes { peers } => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    async fn find_value(&self, to: &PeerId, key: Key) -> Result<(Option<Vec<u8>>, Vec<PeerId>)> {
        match self.request(to, DhtRequest::FindValue { key }).await? {
            DhtResponse::Found { value } => Ok((Some(value), Vec::new())),
            DhtResponse::NotFound { closer } => Ok((None, closer)),
            other => Err(unexpected(other)),
        }
    }

    async fn store(&self, to: &PeerId, key: Key, value: Vec<u8>) -> Result<()> {
        match self.request(to, DhtRequest::Store { key, value }).await? {
            DhtResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn ping(&self, to: &PeerId) -> Result<()> {
        match self.request(to, DhtRequest::Ping).await? {
            DhtResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl MeshActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut signal_rx: mpsc::Receiver<SignalMessage>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        let mut signaling_open = true;
        let mut transport_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(Command::SignalingRestored(channel)) => {
                        signal_rx = self.install_signaling(channel).await;
                        signaling_open = true;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                message = signal_rx.recv(), if signaling_open => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        warn!("signaling session lost; existing channels stay up");
                        signaling_open = false;
                        self.pending_joins.clear();
                        self.restore_signaling();
                    }
                },
                event = transport_rx.recv(), if transport_open => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => transport_open = false,
                },
                _ = maintenance.tick() => self.expire_negotiations().await,
            }
        }
        debug!(peer = %self.identity.id, "mesh actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::JoinRoom(room, reply) => {
                self.joined_rooms.insert(room.clone());
                let join = SignalMessage::Join {
                    room: room.clone(),
                    peer_id: self.identity.id,
                    public_key: self.identity.public_key,
                };
                if self.signal_tx.send(join).await.is_ok() {
                    self.pending_joins.insert(room, reply);
                }
            }
            Command::CancelJoin(room) => {
                self.pending_joins.remove(&room);
            }
            Command::LeaveRoom(room) => self.leave_room(&room).await,
            Command::Send(peer, body, reply) => {
                let _ = reply.send(self.send_body(&peer, body));
            }
            Command::Broadcast(body, exclude, reply) => {
                let _ = reply.send(self.broadcast(body, &exclude));
            }
            Command::Request(peer, request, response_tx, sent_tx) => {
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                let body = PeerMessageBody::DhtRequest {
                    request_id,
                    request,
                };
                if self.send_body(&peer, body) {
                    self.pending_requests.insert(request_id, (peer, response_tx));
                    let _ = sent_tx.send(Some(request_id));
                } else {
                    let _ = sent_tx.send(None);
                }
            }
            Command::CancelRequest(request_id) => {
                self.pending_requests.remove(&request_id);
            }
            Command::Reconnect(peer) => self.reconnect(peer).await,
            Command::ConnectedPeers(reply) => {
                let _ = reply.send(self.connected_peers());
            }
            Command::RoomPeers(room, reply) => {
                let members = self.room_members.get(&room);
                let peers = self
                    .connected_peers()
                    .into_iter()
                    .filter(|p| members.is_some_and(|m| m.contains(p)))
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Peer(peer, reply) => {
                let _ = reply.send(self.peers.get(&peer).cloned());
            }
            Command::SetLastSync(peer, at) => {
                if let Some(conn) = self.peers.get_mut(&peer) {
                    conn.last_sync = at;
                }
            }
            Command::Stats(reply) => {
                let connecting = self
                    .peers
                    .values()
                    .filter(|p| p.state == ConnectionState::Connecting)
                    .count();
                let _ = reply.send(MeshStats {
                    connected: self.connected_peers().len(),
                    connecting,
                    verification_failures: self.verification_failures,
                    pending_requests: self.pending_requests.len(),
                });
            }
            Command::SignalingRestored(_) => {
                trace!("signaling restore handled by the run loop");
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| p.peer_id)
            .collect();
        peers.sort();
        peers
    }

    fn seal(&self, body: PeerMessageBody) -> Option<Vec<u8>> {
        match PeerMessage::seal(&self.identity, body) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, "failed to seal peer message");
                None
            }
        }
    }

    fn send_body(&self, peer: &PeerId, body: PeerMessageBody) -> bool {
        let connected = self
            .peers
            .get(peer)
            .is_some_and(|p| p.state == ConnectionState::Connected);
        if !connected {
            return false;
        }
        let kind = body.kind();
        let Some(frame) = self.seal(body) else {
            return false;
        };
        let sent = self.transport.send(peer, frame);
        if !sent {
            debug!(peer = %peer, kind, "peer send queue refused frame");
        }
        sent
    }

    fn broadcast(&self, body: PeerMessageBody, exclude: &[PeerId]) -> usize {
        let targets: Vec<PeerId> = self
            .connected_peers()
            .into_iter()
            .filter(|p| !exclude.contains(p))
            .collect();
        if targets.is_empty() {
            return 0;
        }
        let Some(frame) = self.seal(body) else {
            return 0;
        };
        targets
            .iter()
            .filter(|peer| self.transport.send(peer, frame.clone()))
            .count()
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    async fn handle_signal(&mut self, message: SignalMessage) {
        let local = self.identity.id;
        match message {
            SignalMessage::Peers { room, peers } => self.handle_roster(room, peers).await,
            SignalMessage::PeerJoined { room, peer_id, .. } => {
                if peer_id != local && self.joined_rooms.contains(&room) {
                    debug!(room = %room, peer = %peer_id, "peer joined room");
                    self.room_members.entry(room).or_default().insert(peer_id);
                }
            }
            SignalMessage::PeerLeft { room, peer_id } => {
                if let Some(members) = self.room_members.get_mut(&room) {
                    members.remove(&peer_id);
                }
                if !self.shares_room(&peer_id) && self.peers.contains_key(&peer_id) {
                    debug!(room = %room, peer = %peer_id, "peer left our last shared room");
                    self.drop_peer(&peer_id).await;
                }
            }
            SignalMessage::Offer { offer, to, from } if to == local => {
                self.handle_offer(from, offer).await;
            }
            SignalMessage::Answer { answer, to, from } if to == local => {
                self.handle_answer(from, answer).await;
            }
            SignalMessage::IceCandidate { candidate, to, from } if to == local => {
                if self.peers.contains_key(&from)
                    && let Err(err) = self.transport.add_candidate(&from, candidate).await
                {
                    debug!(peer = %from, error = %err, "ignoring candidate");
                }
            }
            SignalMessage::Error { message } => {
                warn!(message = %message, "signaling server reported an error");
            }
            other => trace!(?other, "ignoring signaling message"),
        }
    }

    /// Reconnect in the background with exponential backoff.
    fn restore_signaling(&self) {
        let Some(connector) = self.connector.clone() else {
            warn!("no signaling connector; rooms can no longer be joined");
            return;
        };
        let cmd_tx = self.cmd_tx.clone();
        let max = self.config.signaling_retry_max_delay;
        let mut delay = self.config.signaling_retry_delay;
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                tokio::time::sleep(delay).await;
                attempt += 1;
                let result = connector.connect().await;
                let Some(cmd_tx) = cmd_tx.upgrade().filter(|tx| !tx.is_closed()) else {
                    return;
                };
                match result {
                    Ok(channel) => {
                        let _ = cmd_tx.send(Command::SignalingRestored(channel)).await;
                        return;
                    }
                    Err(err) => {
                        delay = next_backoff(delay, max);
                        warn!(
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "signaling reconnect failed"
                        );
                    }
                }
            }
        });
    }

    /// Switch to a new session and announce ourselves in every joined room.
    async fn install_signaling(&mut self, channel: SignalingChannel) -> mpsc::Receiver<SignalMessage> {
        let SignalingChannel { tx, rx } = channel;
        self.signal_tx = tx;
        // Peers given up on during the outage get another chance.
        self.unreachable.clear();
        let mut rooms: Vec<String> = self.joined_rooms.iter().cloned().collect();
        rooms.sort();
        for room in &rooms {
            let join = SignalMessage::Join {
                room: room.clone(),
                peer_id: self.identity.id,
                public_key: self.identity.public_key,
            };
            if self.signal_tx.send(join).await.is_err() {
                warn!(room = %room, "new signaling session closed during re-join");
                break;
            }
        }
        info!(rooms = rooms.len(), "signaling session restored");
        rx
    }

    fn shares_room(&self, peer: &PeerId) -> bool {
        self.room_members
            .iter()
            .any(|(room, members)| self.joined_rooms.contains(room) && members.contains(peer))
    }

    async fn handle_roster(&mut self, room: String, roster: Vec<RosterEntry>) {
        let local = self.identity.id;
        let members = self.room_members.entry(room.clone()).or_default();
        for entry in &roster {
            if entry.peer_id != local {
                members.insert(entry.peer_id);
            }
        }

        let mut offered = Vec::new();
        for entry in roster {
            if offered.len() >= self.config.max_peers_per_room {
                debug!(room = %room, max = self.config.max_peers_per_room, "room peer limit reached");
                break;
            }
            if entry.peer_id == local || entry.public_key.peer_id() != entry.peer_id {
                continue;
            }
            if self.unreachable.contains(&entry.peer_id) {
                trace!(peer = %entry.peer_id, "skipping peer marked unreachable");
                continue;
            }
            if !self.peers.contains_key(&entry.peer_id) {
                self.initiate(entry.peer_id, entry.public_key).await;
            }
            offered.push(entry.peer_id);
        }

        info!(room = %room, peers = offered.len(), "joined room");
        if let Some(reply) = self.pending_joins.remove(&room) {
            let _ = reply.send(offered);
        }
    }

    async fn initiate(&mut self, peer: PeerId, public_key: PublicKey) {
        self.peers.insert(
            peer,
            PeerConnection {
                peer_id: peer,
                public_key,
                state: ConnectionState::Connecting,
                role: Role::Initiator,
                last_sync: 0,
                attempts: 0,
                since: Instant::now(),
            },
        );
        self.send_offer(peer).await;
    }

    async fn send_offer(&mut self, peer: PeerId) {
        match self.transport.create_offer(&peer).await {
            Ok(offer) => {
                let message = SignalMessage::Offer {
                    offer,
                    to: peer,
                    from: self.identity.id,
                };
                if self.signal_tx.send(message).await.is_err() {
                    self.handle_failure(peer, "signaling session closed").await;
                } else {
                    debug!(peer = %peer, "sent offer");
                }
            }
            Err(err) => {
                self.handle_failure(peer, &format!("failed to create offer: {err}")).await;
            }
        }
    }

    async fn handle_offer(&mut self, from: PeerId, offer: SessionDescription) {
        if offer.public_key.peer_id() != from {
            warn!(peer = %from, "offer key does not match sender");
            return;
        }

        if let Some(existing) = self.peers.get(&from)
            && existing.role == Role::Initiator
            && existing.state == ConnectionState::Connecting
            && self.identity.id < from
        {
            // Both sides offered at once; the lower id keeps the initiator role.
            trace!(peer = %from, "ignoring crossed offer");
            return;
        }

        if self.peers.contains_key(&from) {
            self.transport.close(&from).await;
        }
        self.unreachable.remove(&from);
        let previous_sync = self.peers.get(&from).map_or(0, |p| p.last_sync);
        self.peers.insert(
            from,
            PeerConnection {
                peer_id: from,
                public_key: offer.public_key,
                state: ConnectionState::Connecting,
                role: Role::Responder,
                last_sync: previous_sync,
                attempts: 0,
                since: Instant::now(),
            },
        );

        match self.transport.accept_offer(&from, offer).await {
            Ok(answer) => {
                let message = SignalMessage::Answer {
                    answer,
                    to: from,
                    from: self.identity.id,
                };
                if self.signal_tx.send(message).await.is_err() {
                    self.handle_failure(from, "signaling session closed").await;
                } else {
                    debug!(peer = %from, "answered offer");
                }
            }
            Err(err) => {
                self.handle_failure(from, &format!("failed to accept offer: {err}")).await;
            }
        }
    }

    async fn handle_answer(&mut self, from: PeerId, answer: SessionDescription) {
        let expected = self.peers.get(&from).is_some_and(|p| {
            p.role == Role::Initiator
                && p.state == ConnectionState::Connecting
                && p.public_key == answer.public_key
        });
        if !expected {
            warn!(peer = %from, "unexpected answer");
            return;
        }
        if let Err(err) = self.transport.accept_answer(&from, answer).await {
            self.handle_failure(from, &format!("failed to apply answer: {err}")).await;
        }
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer } => {
                let Some(conn) = self.peers.get_mut(&peer) else {
                    debug!(peer = %peer, "closing channel nobody negotiated");
                    self.transport.close(&peer).await;
                    return;
                };
                conn.state = ConnectionState::Connected;
                conn.attempts = 0;
                conn.since = Instant::now();
                self.unreachable.remove(&peer);
                info!(peer = %peer, role = ?conn.role, "peer connected");
                self.emit(MeshEvent::PeerConnected { peer });
            }
            TransportEvent::Failed { peer, reason } => {
                self.handle_failure(peer, &reason).await;
            }
            TransportEvent::Closed { peer, reason } => {
                let Some(conn) = self.peers.get(&peer) else {
                    return;
                };
                match (conn.role, conn.state) {
                    (Role::Initiator, ConnectionState::Connected) => {
                        self.handle_failure(peer, &reason).await;
                    }
                    (Role::Initiator, _) => {
                        trace!(peer = %peer, state = ?conn.state, "ignoring close while reconnecting");
                    }
                    (Role::Responder, state) => {
                        debug!(peer = %peer, reason = %reason, "channel closed");
                        self.peers.remove(&peer);
                        self.abandon_requests(&peer);
                        if state == ConnectionState::Connected {
                            self.emit(MeshEvent::PeerDisconnected { peer });
                        }
                    }
                }
            }
            TransportEvent::Frame { peer, data } => self.handle_frame(peer, &data),
            TransportEvent::LocalCandidate { peer, candidate } => {
                let message = SignalMessage::IceCandidate {
                    candidate,
                    to: peer,
                    from: self.identity.id,
                };
                if self.signal_tx.send(message).await.is_err() {
                    debug!(peer = %peer, "cannot trickle candidate without signaling");
                }
            }
        }
    }

    fn handle_frame(&mut self, peer: PeerId, data: &[u8]) {
        let Some(conn) = self.peers.get(&peer) else {
            trace!(peer = %peer, "frame from unknown peer");
            return;
        };
        if conn.state != ConnectionState::Connected {
            trace!(peer = %peer, state = ?conn.state, "frame on channel that is not open");
            return;
        }

        let message = match PeerMessage::open(data, &peer, &conn.public_key) {
            Ok(message) => message,
            Err(rejection) => {
                self.verification_failures += 1;
                let err = NetworkError::VerificationFailure(rejection.to_string());
                warn!(peer = %peer, error = %err, "dropping peer message");
                return;
            }
        };

        match message.body {
            PeerMessageBody::DhtResponse {
                request_id,
                response,
            } => match self.pending_requests.remove(&request_id) {
                Some((expected, reply)) if expected == peer => {
                    let _ = reply.send(response);
                }
                Some(entry) => {
                    warn!(peer = %peer, request_id, "response from the wrong peer");
                    self.pending_requests.insert(request_id, entry);
                }
                None => trace!(peer = %peer, request_id, "late or unknown dht response"),
            },
            PeerMessageBody::Unknown => {
                trace!(peer = %peer, "ignoring message of unknown type");
            }
            _ => {
                let kind = message.body.kind();
                if self
                    .inbound_tx
                    .try_send(InboundMessage { from: peer, message })
                    .is_err()
                {
                    warn!(peer = %peer, kind, "inbound queue full, dropping message");
                }
            }
        }
    }

    fn emit(&self, event: MeshEvent) {
        if let Err(err) = self.events_tx.try_send(event) {
            warn!(error = %err, "mesh event queue full");
        }
    }

    /// Retry as initiator while attempts remain; otherwise give the peer up.
    async fn handle_failure(&mut self, peer: PeerId, reason: &str) {
        let Some(conn) = self.peers.get_mut(&peer) else {
            return;
        };
        let was_connected = conn.state == ConnectionState::Connected;
        conn.state = ConnectionState::Failed;
        let role = conn.role;
        let attempts = conn.attempts;
        let retry = role == Role::Initiator && attempts < self.config.reconnect_attempts;
        if retry {
            conn.attempts += 1;
        }

        if was_connected {
            self.emit(MeshEvent::PeerDisconnected { peer });
        }
        self.transport.close(&peer).await;
        self.abandon_requests(&peer);

        if retry {
            debug!(
                peer = %peer,
                attempt = attempts + 1,
                max = self.config.reconnect_attempts,
                reason = %reason,
                "channel failed, scheduling reconnect"
            );
            self.schedule_reconnect(peer);
            return;
        }

        self.peers.remove(&peer);
        if role == Role::Initiator {
            self.unreachable.insert(peer);
            let error = NetworkError::PeerConnectionFailure {
                peer,
                attempts: attempts + 1,
            };
            warn!(peer = %peer, reason = %reason, error = %error, "peer unreachable");
            self.emit(MeshEvent::PeerUnreachable { peer, error });
        } else {
            debug!(peer = %peer, reason = %reason, "responder channel failed, waiting for a new offer");
        }
    }

    fn schedule_reconnect(&self, peer: PeerId) {
        let cmd_tx = self.cmd_tx.clone();
        let delay = self.config.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx.send(Command::Reconnect(peer)).await;
            }
        });
    }

    async fn reconnect(&mut self, peer: PeerId) {
        if !self
            .peers
            .get(&peer)
            .is_some_and(|p| p.state == ConnectionState::Failed)
        {
            return;
        }
        if !self.shares_room(&peer) {
            debug!(peer = %peer, "no shared room left, not reconnecting");
            self.peers.remove(&peer);
            return;
        }
        if let Some(conn) = self.peers.get_mut(&peer) {
            conn.state = ConnectionState::Connecting;
            conn.since = Instant::now();
        }
        debug!(peer = %peer, "reconnecting");
        self.send_offer(peer).await;
    }

    /// Drop requests waiting on `peer`; their callers see the channel close.
    fn abandon_requests(&mut self, peer: &PeerId) {
        self.pending_requests.retain(|_, (expected, _)| *expected != *peer);
    }

    async fn expire_negotiations(&mut self) {
        // Callers that gave up before their rpc timeout leave a closed sender.
        self.pending_requests.retain(|_, (_, reply)| !reply.is_closed());

        let timeout = self.config.negotiation_timeout;
        let expired: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.state == ConnectionState::Connecting && p.since.elapsed() > timeout)
            .map(|p| p.peer_id)
            .collect();
        for peer in expired {
            self.handle_failure(peer, "negotiation timed out").await;
        }
    }

    async fn drop_peer(&mut self, peer: &PeerId) {
        self.abandon_requests(peer);
        if let Some(conn) = self.peers.remove(peer) {
            self.transport.close(peer).await;
            if conn.state == ConnectionState::Connected {
                self.emit(MeshEvent::PeerDisconnected { peer: *peer });
            }
        }
    }

    async fn leave_room(&mut self, room: &str) {
        if !self.joined_rooms.remove(room) {
            return;
        }
        let _ = self
            .signal_tx
            .send(SignalMessage::PeerLeft {
                room: room.to_string(),
                peer_id: self.identity.id,
            })
            .await;

        let members = self.room_members.remove(room).unwrap_or_default();
        for peer in members {
            if !self.shares_room(&peer) {
                self.drop_peer(&peer).await;
            }
        }
        info!(room = %room, "left room");
    }

    async fn shutdown(&mut self) {
        let rooms: Vec<String> = self.joined_rooms.iter().cloned().collect();
        for room in rooms {
            self.leave_room(&room).await;
        }
        let peers: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peers {
            self.drop_peer(&peer).await;
        }
        self.pending_requests.clear();
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::signaling::SignalHub;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use tokio::time::timeout;

    fn fast_config() -> MeshConfig {
        MeshConfig {
            reconnect_delay: Duration::from_millis(20),
            negotiation_timeout: Duration::from_millis(500),
            signaling_timeout: Duration::from_secs(2),
            maintenance_interval: Duration::from_millis(20),
            rpc_timeout: Duration::from_millis(500),
            signaling_retry_delay: Duration::from_millis(20),
            signaling_retry_max_delay: Duration::from_millis(200),
            ..MeshConfig::default()
        }
    }

    struct TestPeer {
        identity: PeerIdentity,
        mesh: MeshTransport,
        rx: MeshReceivers,
    }

    impl TestPeer {
        async fn new(hub: &SignalHub, network: &MemoryNetwork, config: MeshConfig) -> Self {
            let identity = PeerIdentity::from_keypair(Keypair::generate());
            let (events_tx, events_rx) = transport_channel();
            let transport = network.transport(identity.public_key, events_tx);
            let signaling = hub.connect().await.unwrap();
            let (mesh, rx) = MeshTransport::with_reconnect(
                identity.clone(),
                signaling,
                Arc::new(hub.clone()),
                Arc::new(transport),
                events_rx,
                config,
            );
            Self { identity, mesh, rx }
        }

        fn id(&self) -> PeerId {
            self.identity.id
        }

        async fn next_event(&mut self) -> MeshEvent {
            timeout(Duration::from_secs(5), self.rx.events.recv())
                .await
                .expect("mesh event in time")
                .expect("mesh running")
        }

        async fn next_inbound(&mut self) -> InboundMessage {
            timeout(Duration::from_secs(5), self.rx.inbound.recv())
                .await
                .expect("inbound message in time")
                .expect("mesh running")
        }
    }

    fn custom(kind: &str) -> PeerMessageBody {
        PeerMessageBody::Custom {
            kind: kind.into(),
            data: serde_json::json!({"n": 1}),
        }
    }

    #[tokio::test]
    async fn later_joiner_initiates_and_messages_flow() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let mut alice = TestPeer::new(&hub, &network, fast_config()).await;
        let mut bob = TestPeer::new(&hub, &network, fast_config()).await;

        assert!(alice.mesh.join_room("room").await.unwrap().is_empty());
        assert_eq!(bob.mesh.join_room("room").await.unwrap(), vec![alice.id()]);

        assert!(matches!(alice.next_event().await, MeshEvent::PeerConnected { peer } if peer == bob.id()));
        assert!(matches!(bob.next_event().await, MeshEvent::PeerConnected { peer } if peer == alice.id()));

        let bob_view = bob.mesh.peer(&alice.id()).await.unwrap();
        assert_eq!(bob_view.role, Role::Initiator);
        assert_eq!(bob_view.state, ConnectionState::Connected);
        assert_eq!(alice.mesh.peer(&bob.id()).await.unwrap().role, Role::Responder);
        assert_eq!(alice.mesh.room_peers("room").await, vec![bob.id()]);
        assert!(alice.mesh.room_peers("elsewhere").await.is_empty());

        assert!(bob.mesh.send_to_peer(&alice.id(), custom("hello")).await);
        let inbound = alice.next_inbound().await;
        assert_eq!(inbound.from, bob.id());
        assert_eq!(inbound.message.sender, bob.id());
        assert_eq!(inbound.message.body, custom("hello"));

        assert_eq!(alice.mesh.broadcast(custom("all"), &[]).await, 1);
        assert_eq!(alice.mesh.broadcast(custom("none"), &[bob.id()]).await, 0);
        assert_eq!(bob.next_inbound().await.message.body, custom("all"));

        alice.mesh.set_last_sync(&bob.id(), 42).await;
        assert_eq!(alice.mesh.last_sync(&bob.id()).await, Some(42));
    }

    #[tokio::test]
    async fn unreachable_peer_exhausts_reconnects() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let alice = TestPeer::new(&hub, &network, fast_config()).await;
        let mut bob = TestPeer::new(&hub, &network, fast_config()).await;

        alice.mesh.join_room("room").await.unwrap();
        network.set_unreachable(alice.id(), true);
        bob.mesh.join_room("room").await.unwrap();

        match bob.next_event().await {
            MeshEvent::PeerUnreachable { peer, error } => {
                assert_eq!(peer, alice.id());
                assert!(matches!(
                    error,
                    NetworkError::PeerConnectionFailure { attempts, .. } if attempts == DEFAULT_RECONNECT_ATTEMPTS + 1
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(bob.mesh.connected_peers().await.is_empty());
        assert!(!bob.mesh.send_to_peer(&alice.id(), custom("x")).await);
    }

    #[tokio::test]
    async fn initiator_reconnects_after_link_failure() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let mut alice = TestPeer::new(&hub, &network, fast_config()).await;
        let mut bob = TestPeer::new(&hub, &network, fast_config()).await;

        alice.mesh.join_room("room").await.unwrap();
        bob.mesh.join_room("room").await.unwrap();
        assert!(matches!(alice.next_event().await, MeshEvent::PeerConnected { .. }));
        assert!(matches!(bob.next_event().await, MeshEvent::PeerConnected { .. }));

        assert!(network.break_link(alice.id(), bob.id()));
        assert!(matches!(bob.next_event().await, MeshEvent::PeerDisconnected { .. }));
        assert!(matches!(bob.next_event().await, MeshEvent::PeerConnected { peer } if peer == alice.id()));
        assert!(network.is_linked(alice.id(), bob.id()));
    }

    #[tokio::test]
    async fn forged_and_malformed_frames_are_counted_and_dropped() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let mut alice = TestPeer::new(&hub, &network, fast_config()).await;

        // A hand-driven peer so the test controls exactly what goes on the wire.
        let mallory = PeerIdentity::from_keypair(Keypair::generate());
        let (m_events_tx, mut m_events_rx) = transport_channel();
        let m_transport: MemoryTransport = network.transport(mallory.public_key, m_events_tx);
        let mut m_signal = hub.connect().await.unwrap();
        m_signal
            .tx
            .send(SignalMessage::Join {
                room: "room".into(),
                peer_id: mallory.id,
                public_key: mallory.public_key,
            })
            .await
            .unwrap();
        assert!(matches!(m_signal.rx.recv().await, Some(SignalMessage::Peers { .. })));

        alice.mesh.join_room("room").await.unwrap();
        let offer = loop {
            match timeout(Duration::from_secs(5), m_signal.rx.recv()).await.unwrap() {
                Some(SignalMessage::Offer { offer, from, .. }) => {
                    assert_eq!(from, alice.id());
                    break offer;
                }
                Some(SignalMessage::PeerJoined { .. }) => continue,
                other => panic!("unexpected {other:?}"),
            }
        };
        let answer = m_transport.accept_offer(&alice.id(), offer).await.unwrap();
        m_signal
            .tx
            .send(SignalMessage::Answer {
                answer,
                to: alice.id(),
                from: mallory.id,
            })
            .await
            .unwrap();
        assert!(matches!(alice.next_event().await, MeshEvent::PeerConnected { .. }));
        assert!(matches!(m_events_rx.recv().await, Some(TransportEvent::Connected { .. })));

        // Garbage, then a validly signed message from someone else.
        assert!(m_transport.send(&alice.id(), b"not json".to_vec()));
        let stranger = PeerIdentity::from_keypair(Keypair::generate());
        let forged = PeerMessage::seal(&stranger, custom("forged")).unwrap();
        assert!(m_transport.send(&alice.id(), forged));
        let genuine = PeerMessage::seal(&mallory, custom("genuine")).unwrap();
        assert!(m_transport.send(&alice.id(), genuine));

        let inbound = alice.next_inbound().await;
        assert_eq!(inbound.message.body, custom("genuine"));
        assert_eq!(alice.mesh.stats().await.verification_failures, 2);
    }

    #[tokio::test]
    async fn join_without_roster_times_out() {
        let network = MemoryNetwork::new();
        let identity = PeerIdentity::from_keypair(Keypair::generate());
        let (events_tx, events_rx) = transport_channel();
        let transport = network.transport(identity.public_key, events_tx);
        // A signaling peer that never answers.
        let (signal_tx, _server_rx) = mpsc::channel(8);
        let (_server_tx, signal_rx) = mpsc::channel(8);
        let config = MeshConfig {
            signaling_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let (mesh, _rx) = MeshTransport::new(
            identity,
            SignalingChannel {
                tx: signal_tx,
                rx: signal_rx,
            },
            Arc::new(transport),
            events_rx,
            config,
        );

        let err = mesh.join_room("room").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetworkError>(),
            Some(NetworkError::SignalingConnection { .. })
        ));
    }

    #[tokio::test]
    async fn dht_requests_are_correlated_with_responses() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let mut alice = TestPeer::new(&hub, &network, fast_config()).await;
        let mut bob = TestPeer::new(&hub, &network, fast_config()).await;
        alice.mesh.join_room("room").await.unwrap();
        bob.mesh.join_room("room").await.unwrap();
        assert!(matches!(alice.next_event().await, MeshEvent::PeerConnected { .. }));
        assert!(matches!(bob.next_event().await, MeshEvent::PeerConnected { .. }));

        let alice_id = alice.id();
        let responder = alice.mesh.clone();
        let mut inbound = alice.rx.inbound;
        tokio::spawn(async move {
            while let Some(InboundMessage { from, message }) = inbound.recv().await {
                if let PeerMessageBody::DhtRequest { request_id, request } = message.body {
                    let response = match request {
                        DhtRequest::Ping => DhtResponse::Ack,
                        DhtRequest::FindNode { target } => DhtResponse::Nodes { peers: vec![target] },
                        _ => DhtResponse::Error { message: "unsupported".into() },
                    };
                    responder
                        .send_to_peer(&from, PeerMessageBody::DhtResponse { request_id, response })
                        .await;
                }
            }
        });

        DhtRpc::ping(&bob.mesh, &alice_id).await.unwrap();
        let target = Keypair::generate().peer_id();
        assert_eq!(DhtRpc::find_node(&bob.mesh, &alice_id, target).await.unwrap(), vec![target]);
        assert!(DhtRpc::store(&bob.mesh, &alice_id, [0u8; 32], vec![1]).await.is_err());

        let stranger = Keypair::generate().peer_id();
        assert!(DhtRpc::ping(&bob.mesh, &stranger).await.is_err());
    }

    #[tokio::test]
    async fn abandoned_requests_do_not_linger() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let mut alice = TestPeer::new(&hub, &network, fast_config()).await;
        let mut bob = TestPeer::new(&hub, &network, fast_config()).await;
        alice.mesh.join_room("room").await.unwrap();
        bob.mesh.join_room("room").await.unwrap();
        assert!(matches!(alice.next_event().await, MeshEvent::PeerConnected { .. }));
        assert!(matches!(bob.next_event().await, MeshEvent::PeerConnected { .. }));

        // Alice never answers; the caller gives up well before rpc_timeout.
        for _ in 0..5 {
            let gave_up = timeout(Duration::from_millis(30), bob.mesh.request(&alice.id(), DhtRequest::Ping)).await;
            assert!(gave_up.is_err());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bob.mesh.stats().await.pending_requests, 0);

        // A request in flight when the peer goes away fails at once.
        let mesh = bob.mesh.clone();
        let alice_id = alice.id();
        let waiting = tokio::spawn(async move { mesh.request(&alice_id, DhtRequest::Ping).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bob.mesh.stats().await.pending_requests, 1);
        alice.mesh.leave_room("room").await;
        let outcome = timeout(Duration::from_millis(400), waiting).await.unwrap().unwrap();
        assert!(outcome.is_err());
        assert_eq!(bob.mesh.stats().await.pending_requests, 0);
    }

    #[tokio::test]
    async fn lost_signaling_session_is_replaced_and_rooms_rejoined() {
        let hub = SignalHub::new();
        let network = MemoryNetwork::new();
        let mut alice = TestPeer::new(&hub, &network, fast_config()).await;
        let mut bob = TestPeer::new(&hub, &network, fast_config()).await;
        alice.mesh.join_room("room").await.unwrap();
        bob.mesh.join_room("room").await.unwrap();
        assert!(matches!(alice.next_event().await, MeshEvent::PeerConnected { .. }));
        assert!(matches!(bob.next_event().await, MeshEvent::PeerConnected { .. }));

        hub.disconnect_peer(&bob.id()).await;

        // The hub reports bob gone, so alice drops the channel; bob comes back
        // on a new session and offers again.
        let mut dropped = false;
        loop {
            match alice.next_event().await {
                MeshEvent::PeerDisconnected { peer } if peer == bob.id() => dropped = true,
                MeshEvent::PeerConnected { peer } if peer == bob.id() => break,
                _ => {}
            }
        }
        assert!(dropped);

        let deadline = Instant::now() + Duration::from_secs(5);
        while hub.room_size("room").await < 2 {
            assert!(Instant::now() < deadline, "bob never re-joined");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while bob.mesh.connected_peers().await != vec![alice.id()] {
            assert!(Instant::now() < deadline, "bob never reconnected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(bob.mesh.send_to_peer(&alice.id(), custom("after outage")).await);
        assert_eq!(alice.next_inbound().await.message.body, custom("after outage"));

        // Later joiners still find bob through the new session.
        let mut carol = TestPeer::new(&hub, &network, fast_config()).await;
        let mut offered = carol.mesh.join_room("room").await.unwrap();
        offered.sort();
        let mut expected = vec![alice.id(), bob.id()];
        expected.sort();
        assert_eq!(offered, expected);
        assert!(matches!(carol.next_event().await, MeshEvent::PeerConnected { .. }));
    }
}
