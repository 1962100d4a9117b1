//! # Seymour Mesh - Peer-to-Peer Comment Synchronization
//!
//! Comments on web pages, exchanged directly between the browsers (or
//! daemons) that have the page open. There is no central comment server:
//!
//! - **Identity**: Ed25519 keypairs; the peer id is the BLAKE3 hash of the
//!   public key, and every comment, vote, deletion and peer message is signed
//! - **DHT**: Kademlia-style routing and record storage for room discovery
//! - **Mesh**: direct, authenticated peer channels negotiated through a
//!   signaling server (QUIC data path)
//! - **Gossip**: hop-bounded epidemic broadcast of new comments, votes and
//!   deletions
//! - **Sync**: periodic anti-entropy so connected peers converge even when
//!   gossip misses
//!
//! ## Architecture
//!
//! Every stateful component is an actor: a cheap `Clone` handle talking to a
//! task that owns all of the component's state through `mpsc` commands and
//! `oneshot` replies. The [`NetworkController`] owns one of each and routes
//! mesh traffic between them.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | `NetworkController`, the public facade |
//! | `identity` | Keypairs, peer ids, persisted local identity |
//! | `crypto` | Canonical JSON, domain-separated signatures, TLS certificates |
//! | `comment` | Comments, votes, tombstones and their merge rules |
//! | `dht` | Routing table, iterative lookups, replicated records |
//! | `mesh` | Per-room peer connections over signaling + transport |
//! | `signaling` | WebSocket rendezvous client and server |
//! | `transport` | QUIC peer channels and an in-memory test network |
//! | `gossip` | Epidemic broadcast with dedup and TTL |
//! | `sync` | Anti-entropy comment sync |
//! | `storage` | Record stores and the comment store |
//! | `protocols` | Trait seams between components |
//! | `messages` | Wire types |

mod comment;
mod crypto;
mod dht;
mod error;
mod gossip;
mod identity;
mod mesh;
mod messages;
mod node;
mod protocols;
mod signaling;
mod storage;
mod sync;
mod transport;

pub use comment::{Comment, CommentDraft, CommentId, Deletion, MergeOutcome, Vote, normalize_room_id};
pub use dht::{DhtConfig, DhtNode, DhtStats, LookupResult, LookupState, RoomRoster, hash_key};
pub use error::NetworkError;
pub use gossip::{GossipConfig, GossipDelivery, GossipOutcome, GossipProtocol, GossipStats};
pub use identity::{Keypair, PeerId, PeerIdentity, PublicKey, now_ms};
pub use mesh::{
    ConnectionState, InboundMessage, MeshConfig, MeshEvent, MeshReceivers, MeshStats, MeshTransport,
    PeerConnection, Role, transport_channel,
};
pub use messages::{GossipEnvelope, GossipPayload, MessageId, PeerMessage, PeerMessageBody, SignalMessage};
pub use node::{CustomMessage, NetworkConfig, NetworkController, NetworkParts, NetworkStats};
pub use protocols::{DhtRpc, PeerSender, PeerTransport, SignalingConnector, TransportEvent};
pub use signaling::{
    SignalHub, SignalServers, SignalingChannel, bind_signal_server, connect_websocket, connect_with_fallback,
};
pub use storage::{CommentStore, FileStore, MemoryStore, RecordStore, StorageError};
pub use sync::{CommentEvent, CommentSyncEngine, SyncConfig, SyncStats};
pub use transport::{MemoryNetwork, MemoryTransport, QuicTransport};
