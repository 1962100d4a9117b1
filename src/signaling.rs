//! Signaling: the rendezvous used to find room members and relay channel
//! negotiation between them.
//!
//! # Client Side
//! - [`connect_websocket`]: one WebSocket connection, JSON text frames
//! - [`connect_with_fallback`]: walk a list of servers until one answers,
//!   backing off exponentially between attempts
//! - [`SignalServers`]: the same walk behind [`SignalingConnector`], so the
//!   mesh can replace a session that drops mid-run
//!
//! Both yield a [`SignalingChannel`], a pair of message queues. The mesh only
//! ever sees the channel, so in-process tests hand it one from a [`SignalHub`].
//!
//! # Server Side
//! - `SignalHub`: cheap handle to the hub actor
//! - `SignalHubActor`: owns room membership and routes messages by peer id
//! - [`serve_websocket`]: bridges WebSocket clients onto a hub
//!
//! The hub checks that a joining peer's id is derived from the key it
//! announces, and that every routed message comes from the peer registered on
//! that connection. It never looks inside offers or answers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::{PeerId, PublicKey};
use crate::messages::{RosterEntry, SignalMessage};
use crate::protocols::SignalingConnector;

/// Connection attempts per server before moving to the next one.
pub const DEFAULT_ATTEMPTS_PER_SERVER: usize = 2;

/// First pause between attempts; doubles after every failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

const CHANNEL_DEPTH: usize = 256;

/// A live signaling session. Dropping `tx` ends it; `rx` yields `None` once
/// the server side is gone.
pub struct SignalingChannel {
    pub tx: mpsc::Sender<SignalMessage>,
    pub rx: mpsc::Receiver<SignalMessage>,
}

// ============================================================================
// Client
// ============================================================================

pub async fn connect_websocket(url: &str, timeout: Duration) -> Result<SignalingChannel> {
    let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| anyhow!("timed out connecting to {url}"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<SignalMessage>(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<SignalMessage>(CHANNEL_DEPTH);

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "unencodable signaling message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let server = url.to_string();
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                    Ok(message) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(server = %server, error = %err, "dropping malformed signaling message"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(server = %server, error = %err, "signaling connection failed");
                    break;
                }
            }
        }
        debug!(server = %server, "signaling connection closed");
    });

    Ok(SignalingChannel {
        tx: out_tx,
        rx: in_rx,
    })
}

/// Double `delay`, capped at `max`.
pub fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

/// Try each server in order, `attempts_per_server` times each. Returns the
/// server that answered along with its channel.
pub async fn connect_with_fallback(
    urls: &[String],
    attempts_per_server: usize,
    retry_delay: Duration,
    timeout: Duration,
) -> Result<(String, SignalingChannel)> {
    let mut attempts = 0;
    let mut delay = retry_delay;
    let mut last_error = String::from("no signaling servers configured");

    for url in urls {
        for attempt in 1..=attempts_per_server.max(1) {
            attempts += 1;
            match connect_websocket(url, timeout).await {
                Ok(channel) => {
                    info!(server = %url, attempts, "connected to signaling server");
                    return Ok((url.clone(), channel));
                }
                Err(err) => {
                    warn!(server = %url, attempt, error = %err, "signaling connection attempt failed");
                    last_error = format!("{err:#}");
                    if attempt < attempts_per_server {
                        tokio::time::sleep(delay).await;
                        delay = next_backoff(delay, DEFAULT_MAX_RETRY_DELAY);
                    }
                }
            }
        }
    }

    Err(NetworkError::SignalingConnection {
        attempts,
        last_error,
    }
    .into())
}

/// A server list walked with [`connect_with_fallback`] on every connect.
#[derive(Clone, Debug)]
pub struct SignalServers {
    pub urls: Vec<String>,
    pub attempts_per_server: usize,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

#[async_trait]
impl SignalingConnector for SignalServers {
    async fn connect(&self) -> Result<SignalingChannel> {
        let (server, channel) =
            connect_with_fallback(&self.urls, self.attempts_per_server, self.retry_delay, self.timeout).await?;
        info!(server = %server, "signaling session re-established");
        Ok(channel)
    }
}

// ============================================================================
// Hub
// ============================================================================

type ConnId = u64;

struct Client {
    tx: mpsc::Sender<SignalMessage>,
    peer: Option<(PeerId, PublicKey)>,
    rooms: HashSet<String>,
}

enum HubCommand {
    Register(mpsc::Sender<SignalMessage>, oneshot::Sender<ConnId>),
    Message(ConnId, SignalMessage),
    Disconnect(ConnId),
    RoomSize(String, oneshot::Sender<usize>),
    Kick(PeerId),
    Quit,
}

#[derive(Clone)]
pub struct SignalHub {
    cmd_tx: mpsc::Sender<HubCommand>,
}

struct SignalHubActor {
    clients: HashMap<ConnId, Client>,
    rooms: HashMap<String, HashSet<ConnId>>,
    by_peer: HashMap<PeerId, ConnId>,
    next_conn: ConnId,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let actor = SignalHubActor {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            by_peer: HashMap::new(),
            next_conn: 0,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Open an in-process session on this hub.
    pub async fn connect(&self) -> Result<SignalingChannel> {
        let (to_client_tx, to_client_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (from_client_tx, mut from_client_rx) = mpsc::channel::<SignalMessage>(CHANNEL_DEPTH);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HubCommand::Register(to_client_tx, reply_tx))
            .await
            .map_err(|_| anyhow!("signal hub stopped"))?;
        let conn = reply_rx.await.map_err(|_| anyhow!("signal hub stopped"))?;

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client_rx.recv().await {
                if cmd_tx.send(HubCommand::Message(conn, message)).await.is_err() {
                    return;
                }
            }
            let _ = cmd_tx.send(HubCommand::Disconnect(conn)).await;
        });

        Ok(SignalingChannel {
            tx: from_client_tx,
            rx: to_client_rx,
        })
    }

    pub async fn room_size(&self, room: &str) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(HubCommand::RoomSize(room.to_string(), tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close the session `peer` is registered on, as if its connection dropped.
    pub async fn disconnect_peer(&self, peer: &PeerId) {
        let _ = self.cmd_tx.send(HubCommand::Kick(*peer)).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(HubCommand::Quit).await;
    }
}

#[async_trait]
impl SignalingConnector for SignalHub {
    async fn connect(&self) -> Result<SignalingChannel> {
        SignalHub::connect(self).await
    }
}

impl SignalHubActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HubCommand::Register(tx, reply) => {
                    let conn = self.next_conn;
                    self.next_conn += 1;
                    self.clients.insert(
                        conn,
                        Client {
                            tx,
                            peer: None,
                            rooms: HashSet::new(),
                        },
                    );
                    let _ = reply.send(conn);
                }
                HubCommand::Message(conn, message) => self.handle_message(conn, message),
                HubCommand::Disconnect(conn) => self.disconnect(conn),
                HubCommand::RoomSize(room, reply) => {
                    let _ = reply.send(self.rooms.get(&room).map_or(0, |m| m.len()));
                }
                HubCommand::Kick(peer) => {
                    if let Some(conn) = self.by_peer.get(&peer).copied() {
                        self.disconnect(conn);
                    }
                }
                HubCommand::Quit => break,
            }
        }
    }

    fn deliver(&self, conn: ConnId, message: SignalMessage) {
        if let Some(client) = self.clients.get(&conn)
            && client.tx.try_send(message).is_err()
        {
            warn!(conn, "signaling client queue full, dropping message");
        }
    }

    fn error(&self, conn: ConnId, message: impl Into<String>) {
        self.deliver(
            conn,
            SignalMessage::Error {
                message: message.into(),
            },
        );
    }

    fn handle_message(&mut self, conn: ConnId, message: SignalMessage) {
        match message {
            SignalMessage::Join {
                room,
                peer_id,
                public_key,
            } => self.join(conn, room, peer_id, public_key),
            SignalMessage::PeerLeft { room, peer_id } => {
                if self.registered_peer(conn) == Some(peer_id) {
                    self.leave(conn, &room);
                }
            }
            SignalMessage::Offer { from, to, .. }
            | SignalMessage::Answer { from, to, .. }
            | SignalMessage::IceCandidate { from, to, .. } => {
                if self.registered_peer(conn) != Some(from) {
                    self.error(conn, "sender does not match registered peer");
                    return;
                }
                match self.by_peer.get(&to) {
                    Some(target) => {
                        trace!(from = %from, to = %to, "relaying negotiation message");
                        self.deliver(*target, message);
                    }
                    None => self.error(conn, format!("unknown peer {}", to.to_hex())),
                }
            }
            SignalMessage::Peers { .. } | SignalMessage::PeerJoined { .. } | SignalMessage::Error { .. } => {
                trace!(conn, "ignoring server-only message from client");
            }
        }
    }

    fn registered_peer(&self, conn: ConnId) -> Option<PeerId> {
        self.clients.get(&conn).and_then(|c| c.peer.map(|(id, _)| id))
    }

    fn join(&mut self, conn: ConnId, room: String, peer_id: PeerId, public_key: PublicKey) {
        if !public_key.is_valid() || public_key.peer_id() != peer_id {
            self.error(conn, "peer id does not match public key");
            return;
        }
        if let Some(existing) = self.registered_peer(conn)
            && existing != peer_id
        {
            self.error(conn, "connection already registered to another peer");
            return;
        }
        if let Some(previous) = self.by_peer.insert(peer_id, conn)
            && previous != conn
        {
            debug!(peer = %peer_id, "peer re-registered on a new connection");
            self.disconnect(previous);
            self.by_peer.insert(peer_id, conn);
        }

        let members = self.rooms.entry(room.clone()).or_default();
        let existing: Vec<ConnId> = members.iter().copied().filter(|c| *c != conn).collect();
        members.insert(conn);

        let peers: Vec<RosterEntry> = existing
            .iter()
            .filter_map(|c| self.clients.get(c)?.peer)
            .map(|(peer_id, public_key)| RosterEntry {
                peer_id,
                public_key,
            })
            .collect();

        if let Some(client) = self.clients.get_mut(&conn) {
            client.peer = Some((peer_id, public_key));
            client.rooms.insert(room.clone());
        }

        debug!(room = %room, peer = %peer_id, existing = peers.len(), "peer joined room");
        self.deliver(
            conn,
            SignalMessage::Peers {
                room: room.clone(),
                peers,
            },
        );
        for other in existing {
            self.deliver(
                other,
                SignalMessage::PeerJoined {
                    room: room.clone(),
                    peer_id,
                    public_key,
                },
            );
        }
    }

    fn leave(&mut self, conn: ConnId, room: &str) {
        let Some(peer_id) = self.registered_peer(conn) else {
            return;
        };
        if let Some(client) = self.clients.get_mut(&conn) {
            client.rooms.remove(room);
        }
        let remaining: Vec<ConnId> = match self.rooms.get_mut(room) {
            Some(members) => {
                members.remove(&conn);
                members.iter().copied().collect()
            }
            None => return,
        };
        if remaining.is_empty() {
            self.rooms.remove(room);
        }
        for other in remaining {
            self.deliver(
                other,
                SignalMessage::PeerLeft {
                    room: room.to_string(),
                    peer_id,
                },
            );
        }
    }

    fn disconnect(&mut self, conn: ConnId) {
        let rooms: Vec<String> = match self.clients.get(&conn) {
            Some(client) => client.rooms.iter().cloned().collect(),
            None => return,
        };
        for room in rooms {
            self.leave(conn, &room);
        }
        if let Some(client) = self.clients.remove(&conn)
            && let Some((peer_id, _)) = client.peer
            && self.by_peer.get(&peer_id) == Some(&conn)
        {
            self.by_peer.remove(&peer_id);
            debug!(peer = %peer_id, "signaling client disconnected");
        }
    }
}

// ============================================================================
// WebSocket server
// ============================================================================

/// Bind a WebSocket signaling server and serve it in the background.
pub async fn bind_signal_server(addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind signaling server on {addr}"))?;
    let local = listener.local_addr()?;
    let hub = SignalHub::new();
    let handle = tokio::spawn(serve_websocket(listener, hub));
    info!(addr = %local, "signaling server listening");
    Ok((local, handle))
}

pub async fn serve_websocket(listener: TcpListener, hub: SignalHub) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "signaling accept failed");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = bridge_client(stream, hub).await {
                debug!(remote = %remote, error = %err, "signaling client ended with error");
            }
        });
    }
}

async fn bridge_client(stream: TcpStream, hub: SignalHub) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    let (mut sink, mut source) = ws.split();
    let SignalingChannel { tx, mut rx } = hub.connect().await?;

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "dropping malformed signaling message");
                        let reply = SignalMessage::Error { message: "malformed message".into() };
                        sink.send(Message::Text(reply.to_json()?)).await?;
                    }
                },
                Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
            outbound = rx.recv() => match outbound {
                Some(message) => sink.send(Message::Text(message.to_json()?)).await?,
                None => break,
            },
        }
    }
    let _ = sink.close().await;
    Ok(())
}
