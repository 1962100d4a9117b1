//! # Wire Protocol Messages
//!
//! Every serializable message that crosses a process boundary lives here.
//!
//! | Channel | Format | Types |
//! |---------|--------|-------|
//! | Signaling | JSON text frames, `type` tag | [`SignalMessage`] |
//! | Peer data channel | JSON, one frame per message, signed | [`PeerMessage`] / [`PeerMessageBody`] |
//! | Gossip | nested in `gossip` bodies | [`GossipEnvelope`] / [`GossipPayload`] |
//! | DHT RPC | nested in `dht-request` / `dht-response` | [`DhtRequest`] / [`DhtResponse`] |
//! | Records at rest | bincode, bounded | comments, DHT records, identity |
//!
//! ## Security Limits
//!
//! - `MAX_VALUE_SIZE`: maximum size of a DHT value (1 MiB)
//! - `MAX_FRAME_SIZE`: maximum size of one peer frame
//! - All bincode decoding goes through [`deserialize_bounded`]
//!
//! ## Signed Envelopes
//!
//! A peer frame is the JSON object of a [`PeerMessage`] plus a hex `signature`
//! field. The signature covers the canonical form of the object without that
//! field, under [`PEER_MESSAGE_SIGNATURE_DOMAIN`]. Receivers strip the
//! signature, verify against the channel peer's key, and only then decode the
//! typed body.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::comment::{Comment, Deletion, Vote};
use crate::crypto::{self, PEER_MESSAGE_SIGNATURE_DOMAIN, hex_bytes, hex32};
use crate::dht::Key;
use crate::identity::{PeerId, PeerIdentity, PublicKey, now_ms};

/// Maximum size of a stored value in the DHT (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for bincode deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Maximum size of one peer frame. A sync response carries up to a few hundred
/// comments, and hex doubles DHT values.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. Use this instead of raw
/// `bincode::deserialize` for anything read back from storage.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_record<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Signaling
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
}

/// Stand-in for an SDP blob: who is speaking and where it can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub public_key: PublicKey,
    pub addrs: Vec<SocketAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    Join {
        room: String,
        peer_id: PeerId,
        public_key: PublicKey,
    },
    /// Reply to `join`: everyone already in the room.
    Peers {
        room: String,
        peers: Vec<RosterEntry>,
    },
    Offer {
        offer: SessionDescription,
        to: PeerId,
        from: PeerId,
    },
    Answer {
        answer: SessionDescription,
        to: PeerId,
        from: PeerId,
    },
    IceCandidate {
        candidate: Candidate,
        to: PeerId,
        from: PeerId,
    },
    PeerJoined {
        room: String,
        peer_id: PeerId,
        public_key: PublicKey,
    },
    PeerLeft {
        room: String,
        peer_id: PeerId,
    },
    Error {
        message: String,
    },
}

impl SignalMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode signaling message")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("malformed signaling message")
    }
}

// ============================================================================
// DHT RPC bodies
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DhtRequest {
    Ping,
    FindNode {
        target: PeerId,
    },
    FindValue {
        #[serde(with = "hex32")]
        key: Key,
    },
    Store {
        #[serde(with = "hex32")]
        key: Key,
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DhtResponse {
    Ack,
    Nodes {
        peers: Vec<PeerId>,
    },
    Found {
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
    },
    NotFound {
        closer: Vec<PeerId>,
    },
    Error {
        message: String,
    },
}

// ============================================================================
// Gossip
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(#[serde(with = "hex32")] [u8; 32]);

impl MessageId {
    /// `BLAKE3(canonical(payload) || origin || created_at)`.
    pub fn compute(payload: &GossipPayload, origin: &PeerId, created_at: u64) -> Result<Self> {
        let hash = crypto::content_hash(payload, &[origin.as_bytes(), &created_at.to_be_bytes()])
            .context("gossip payload has no canonical form")?;
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", &hex::encode(self.0)[..16])
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum GossipPayload {
    NewComment { comment: Comment },
    CommentVote { vote: Vote },
    CommentDelete { deletion: Deletion },
}

impl GossipPayload {
    /// Checks every signature the payload carries.
    pub fn verify(&self) -> bool {
        match self {
            GossipPayload::NewComment { comment } => comment.verify().is_ok(),
            GossipPayload::CommentVote { vote } => vote.verify(),
            GossipPayload::CommentDelete { deletion } => deletion.verify(),
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            GossipPayload::NewComment { comment } => &comment.room_id,
            GossipPayload::CommentVote { vote } => &vote.room_id,
            GossipPayload::CommentDelete { deletion } => &deletion.room_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipEnvelope {
    pub message_id: MessageId,
    pub ttl: u8,
    pub origin: PeerId,
    /// Every peer that handled this envelope, origin first.
    pub path: Vec<PeerId>,
    pub created_at: u64,
    pub payload: GossipPayload,
}

// ============================================================================
// Peer data-channel envelope
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PeerMessageBody {
    SyncRequest {
        room_id: String,
        since: u64,
    },
    SyncResponse {
        room_id: String,
        comments: Vec<Comment>,
        /// Newer comments remain; ask again from the last `created_at`.
        #[serde(default)]
        more: bool,
    },
    NewComment {
        comment: Comment,
    },
    Gossip {
        envelope: GossipEnvelope,
    },
    GossipAck {
        message_id: MessageId,
    },
    DhtRequest {
        request_id: u64,
        request: DhtRequest,
    },
    DhtResponse {
        request_id: u64,
        response: DhtResponse,
    },
    /// Opaque application message for collaborators built on the mesh.
    Custom {
        kind: String,
        data: Value,
    },
    #[serde(other)]
    Unknown,
}

impl PeerMessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessageBody::SyncRequest { .. } => "sync-request",
            PeerMessageBody::SyncResponse { .. } => "sync-response",
            PeerMessageBody::NewComment { .. } => "new-comment",
            PeerMessageBody::Gossip { .. } => "gossip",
            PeerMessageBody::GossipAck { .. } => "gossip-ack",
            PeerMessageBody::DhtRequest { .. } => "dht-request",
            PeerMessageBody::DhtResponse { .. } => "dht-response",
            PeerMessageBody::Custom { .. } => "custom",
            PeerMessageBody::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(flatten)]
    pub body: PeerMessageBody,
    pub sender: PeerId,
    pub timestamp: u64,
}

/// Why an inbound peer frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRejection {
    Oversized,
    Malformed,
    MissingSignature,
    BadSignature,
    /// The envelope names a sender other than the authenticated channel peer.
    SenderMismatch,
}

impl std::fmt::Display for MessageRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRejection::Oversized => write!(f, "frame exceeds size limit"),
            MessageRejection::Malformed => write!(f, "malformed envelope"),
            MessageRejection::MissingSignature => write!(f, "envelope is not signed"),
            MessageRejection::BadSignature => write!(f, "envelope signature invalid"),
            MessageRejection::SenderMismatch => write!(f, "sender does not match channel peer"),
        }
    }
}

impl std::error::Error for MessageRejection {}

impl PeerMessage {
    /// Wrap `body` in a signed envelope ready to write to a data channel.
    pub fn seal(identity: &PeerIdentity, body: PeerMessageBody) -> Result<Vec<u8>> {
        let message = PeerMessage {
            body,
            sender: identity.id,
            timestamp: now_ms(),
        };
        let mut value = serde_json::to_value(&message).context("failed to encode peer message")?;
        let signature = identity.sign(PEER_MESSAGE_SIGNATURE_DOMAIN, &value)?;
        if let Value::Object(map) = &mut value {
            map.insert("signature".to_string(), Value::String(hex::encode(signature)));
        }
        serde_json::to_vec(&value).context("failed to encode peer message")
    }

    /// Verify and decode a frame received from `channel_peer`, whose key is
    /// `public_key`.
    pub fn open(
        frame: &[u8],
        channel_peer: &PeerId,
        public_key: &PublicKey,
    ) -> Result<PeerMessage, MessageRejection> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(MessageRejection::Oversized);
        }
        let mut value: Value =
            serde_json::from_slice(frame).map_err(|_| MessageRejection::Malformed)?;
        let signature = value
            .as_object_mut()
            .ok_or(MessageRejection::Malformed)?
            .remove("signature")
            .ok_or(MessageRejection::MissingSignature)?;
        let signature = signature
            .as_str()
            .and_then(|s| hex::decode(s).ok())
            .ok_or(MessageRejection::MissingSignature)?;

        if !PeerIdentity::verify(PEER_MESSAGE_SIGNATURE_DOMAIN, &value, &signature, public_key) {
            return Err(MessageRejection::BadSignature);
        }

        let message: PeerMessage =
            serde_json::from_value(value).map_err(|_| MessageRejection::Malformed)?;
        if message.sender != *channel_peer {
            return Err(MessageRejection::SenderMismatch);
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn identity() -> PeerIdentity {
        PeerIdentity::from_keypair(Keypair::generate())
    }

    #[test]
    fn bounded_deserialization_rejects_garbage() {
        let bytes = serialize_record(&(7u64, "abc".to_string())).unwrap();
        let decoded: (u64, String) = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded, (7, "abc".to_string()));

        let mut oversized = Vec::new();
        oversized.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(deserialize_bounded::<Vec<u8>>(&oversized).is_err());
    }

    #[test]
    fn signal_messages_use_kebab_tags_and_camel_fields() {
        let kp = Keypair::generate();
        let join = SignalMessage::Join {
            room: "https://example.com/a".into(),
            peer_id: kp.peer_id(),
            public_key: kp.public_key(),
        };
        let json: Value = serde_json::from_str(&join.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["peerId"], kp.peer_id().to_hex());

        let candidate = SignalMessage::IceCandidate {
            candidate: Candidate { addr: "127.0.0.1:4000".parse().unwrap() },
            to: kp.peer_id(),
            from: kp.peer_id(),
        };
        let text = candidate.to_json().unwrap();
        assert!(text.contains("\"type\":\"ice-candidate\""));
        assert_eq!(SignalMessage::from_json(&text).unwrap(), candidate);
    }

    #[test]
    fn sealed_envelope_opens_for_the_right_peer() {
        let alice = identity();
        let body = PeerMessageBody::SyncRequest { room_id: "r".into(), since: 5 };
        let frame = PeerMessage::seal(&alice, body.clone()).unwrap();

        let json: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(json["type"], "sync-request");
        assert_eq!(json["roomId"], "r");
        assert!(json["signature"].is_string());

        let opened = PeerMessage::open(&frame, &alice.id, &alice.public_key).unwrap();
        assert_eq!(opened.body, body);
        assert_eq!(opened.sender, alice.id);
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let alice = identity();
        let frame = PeerMessage::seal(
            &alice,
            PeerMessageBody::SyncRequest { room_id: "r".into(), since: 5 },
        )
        .unwrap();
        let text = String::from_utf8(frame).unwrap().replace("\"since\":5", "\"since\":0");

        assert_eq!(
            PeerMessage::open(text.as_bytes(), &alice.id, &alice.public_key),
            Err(MessageRejection::BadSignature)
        );
    }

    #[test]
    fn envelope_from_another_sender_is_rejected() {
        let alice = identity();
        let mallory = identity();
        let frame = PeerMessage::seal(&mallory, PeerMessageBody::Unknown).unwrap();

        // Right key, wrong channel peer.
        assert_eq!(
            PeerMessage::open(&frame, &alice.id, &mallory.public_key),
            Err(MessageRejection::SenderMismatch)
        );
        // Channel peer's key does not verify someone else's signature.
        assert_eq!(
            PeerMessage::open(&frame, &alice.id, &alice.public_key),
            Err(MessageRejection::BadSignature)
        );
    }

    #[test]
    fn unsigned_and_malformed_frames_are_rejected() {
        let alice = identity();
        assert_eq!(
            PeerMessage::open(b"not json", &alice.id, &alice.public_key),
            Err(MessageRejection::Malformed)
        );
        let unsigned = format!(
            r#"{{"type":"gossip-ack","messageId":"{}","sender":"{}","timestamp":1}}"#,
            "00".repeat(32),
            alice.id.to_hex()
        );
        assert_eq!(
            PeerMessage::open(unsigned.as_bytes(), &alice.id, &alice.public_key),
            Err(MessageRejection::MissingSignature)
        );
    }

    #[test]
    fn unknown_message_types_decode_to_unknown() {
        let alice = identity();
        let mut value = serde_json::json!({
            "type": "presence-ping",
            "sender": alice.id,
            "timestamp": 1u64,
        });
        let sig = alice.sign(PEER_MESSAGE_SIGNATURE_DOMAIN, &value).unwrap();
        value["signature"] = Value::String(hex::encode(sig));
        let frame = serde_json::to_vec(&value).unwrap();

        let opened = PeerMessage::open(&frame, &alice.id, &alice.public_key).unwrap();
        assert_eq!(opened.body, PeerMessageBody::Unknown);
    }

    #[test]
    fn dht_bodies_round_trip_through_envelope() {
        let alice = identity();
        let body = PeerMessageBody::DhtRequest {
            request_id: 9,
            request: DhtRequest::Store { key: [3u8; 32], value: vec![1, 2, 3] },
        };
        let frame = PeerMessage::seal(&alice, body.clone()).unwrap();
        let opened = PeerMessage::open(&frame, &alice.id, &alice.public_key).unwrap();
        assert_eq!(opened.body, body);
    }
}
