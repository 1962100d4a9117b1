//! Protocol trait definitions for the networking layer.
//!
//! Components depend on these seams rather than on each other's concrete
//! types, which keeps the dependency graph acyclic and lets tests swap in
//! in-memory implementations.
//!
//! | Trait | Implemented by | Used by |
//! |-------|----------------|---------|
//! | [`DhtRpc`] | `MeshTransport` | `DhtNode` |
//! | [`PeerSender`] | `MeshTransport` | `GossipProtocol`, `CommentSyncEngine` |
//! | [`PeerTransport`] | `QuicTransport`, `MemoryTransport` | `MeshTransport` |
//! | [`SignalingConnector`] | `SignalServers`, `SignalHub` | `MeshTransport` |

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::dht::Key;
use crate::identity::PeerId;
use crate::messages::{Candidate, PeerMessageBody, SessionDescription};
use crate::signaling::SignalingChannel;

/// DHT node operations, addressed by peer id.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ask `to` for the peers it knows closest to `target`.
    async fn find_node(&self, to: &PeerId, target: PeerId) -> Result<Vec<PeerId>>;

    /// Ask `to` for a value; returns the value or closer peers.
    async fn find_value(&self, to: &PeerId, key: Key) -> Result<(Option<Vec<u8>>, Vec<PeerId>)>;

    async fn store(&self, to: &PeerId, key: Key, value: Vec<u8>) -> Result<()>;

    async fn ping(&self, to: &PeerId) -> Result<()>;
}

/// Signed unicast to directly connected peers.
#[async_trait]
pub trait PeerSender: Send + Sync + 'static {
    /// `false` when there is no open channel to `peer`.
    async fn send_to_peer(&self, peer: &PeerId, body: PeerMessageBody) -> bool;

    async fn connected_peers(&self) -> Vec<PeerId>;

    /// When we last asked `peer` for comments during this session.
    async fn last_sync(&self, _peer: &PeerId) -> Option<u64> {
        None
    }

    async fn set_last_sync(&self, _peer: &PeerId, _at_ms: u64) {}
}

/// Opens a fresh signaling session to replace one that was lost.
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<SignalingChannel>;
}

/// What a [`PeerTransport`] reports back to the mesh.
#[derive(Debug)]
pub enum TransportEvent {
    /// A data path to `peer` is open and authenticated.
    Connected { peer: PeerId },
    /// Establishing the data path failed.
    Failed { peer: PeerId, reason: String },
    /// An open data path went away.
    Closed { peer: PeerId, reason: String },
    Frame { peer: PeerId, data: Vec<u8> },
    /// An additional local address worth trickling to `peer`.
    LocalCandidate { peer: PeerId, candidate: Candidate },
}

/// The direct peer data channel, negotiated through signaling.
///
/// Offer/answer exchange mirrors WebRTC: the initiator creates an offer, the
/// responder accepts it and produces an answer, the initiator applies the
/// answer. Candidates may trickle in at any point. Channel state changes and
/// inbound frames are delivered on the event channel handed to the transport
/// at construction.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create_offer(&self, peer: &PeerId) -> Result<SessionDescription>;

    async fn accept_offer(&self, peer: &PeerId, offer: SessionDescription) -> Result<SessionDescription>;

    async fn accept_answer(&self, peer: &PeerId, answer: SessionDescription) -> Result<()>;

    async fn add_candidate(&self, peer: &PeerId, candidate: Candidate) -> Result<()>;

    /// Queue one frame for `peer`. Never blocks; `false` when the channel is
    /// not open or its queue is full.
    fn send(&self, peer: &PeerId, frame: Vec<u8>) -> bool;

    async fn close(&self, peer: &PeerId);

    /// Stop accepting and drop every channel.
    fn shutdown(&self) {}
}

/// Event channel half handed to a transport.
pub type TransportEvents = mpsc::Sender<TransportEvent>;
