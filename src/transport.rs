//! # Peer Data Channels
//!
//! Two implementations of [`PeerTransport`]:
//!
//! - [`QuicTransport`]: QUIC over UDP with mutual TLS. Each side presents a
//!   self-signed certificate carrying its Ed25519 key; the SNI encodes the
//!   expected peer id, so a completed handshake authenticates both ends.
//! - [`MemoryTransport`]: in-process links through a shared [`MemoryNetwork`],
//!   with knobs for unreachable peers and broken links.
//!
//! ## Negotiation
//!
//! The initiator's offer and the responder's answer carry the sender's public
//! key and primary address; further advertised addresses trickle as
//! candidates. Once the answer arrives the initiator dials every known address
//! in order. The responder only accepts connections from peers it has an open
//! negotiation with.
//!
//! ## Framing
//!
//! One bidirectional stream per peer, frames are `u32` big-endian length plus
//! payload. A zero-length frame opens the stream and is never delivered.
//! Frames from one peer arrive in send order.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::crypto::{
    create_client_config, create_server_config, extract_verified_key, generate_ed25519_cert,
    peer_id_to_sni,
};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::{Candidate, MAX_FRAME_SIZE, SessionDescription};
use crate::protocols::{PeerTransport, TransportEvent, TransportEvents};

/// How long one dial attempt to one address may take.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames queued per peer before `send` starts refusing.
const WRITE_QUEUE_DEPTH: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// QUIC
// ============================================================================

struct PeerChannel {
    writer: mpsc::Sender<Vec<u8>>,
    connection: Connection,
}

struct QuicInner {
    public_key: PublicKey,
    endpoint: Endpoint,
    client_config: ClientConfig,
    addrs: Vec<SocketAddr>,
    events: TransportEvents,
    channels: Mutex<HashMap<PeerId, PeerChannel>>,
    /// Open negotiations and the addresses learned for each so far.
    negotiations: Mutex<HashMap<PeerId, Vec<SocketAddr>>>,
}

#[derive(Clone)]
pub struct QuicTransport {
    inner: Arc<QuicInner>,
}

impl QuicTransport {
    /// Bind a QUIC endpoint and start accepting. With no `advertise`
    /// addresses the bound address is advertised, unspecified IPs mapped to
    /// loopback.
    pub fn bind(
        keypair: &Keypair,
        bind: SocketAddr,
        advertise: Vec<SocketAddr>,
        events: TransportEvents,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let (server_certs, server_key) = generate_ed25519_cert(keypair)?;
        let (client_certs, client_key) = generate_ed25519_cert(keypair)?;

        let server_config = create_server_config(server_certs, server_key, idle_timeout)?;
        let client_config = create_client_config(client_certs, client_key, idle_timeout)?;

        let endpoint = Endpoint::server(server_config, bind)
            .with_context(|| format!("failed to bind QUIC endpoint on {bind}"))?;
        let local_addr = endpoint.local_addr().context("endpoint has no local address")?;

        let addrs = if advertise.is_empty() {
            vec![reachable_form(local_addr)]
        } else {
            advertise
        };

        let inner = Arc::new(QuicInner {
            public_key: keypair.public_key(),
            endpoint,
            client_config,
            addrs,
            events,
            channels: Mutex::new(HashMap::new()),
            negotiations: Mutex::new(HashMap::new()),
        });

        tokio::spawn(inner.clone().accept_loop());

        debug!(addr = %local_addr, peer = %keypair.peer_id(), "QUIC transport listening");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.endpoint.local_addr()?)
    }

    pub fn advertised_addrs(&self) -> &[SocketAddr] {
        &self.inner.addrs
    }

    fn description(&self) -> SessionDescription {
        SessionDescription {
            public_key: self.inner.public_key,
            addrs: self.inner.addrs.iter().take(1).copied().collect(),
        }
    }

    /// Addresses beyond the primary one go out as trickled candidates. The
    /// mesh calls in while it also drains the event queue, so never wait.
    fn trickle_candidates(&self, peer: &PeerId) {
        for addr in self.inner.addrs.iter().skip(1) {
            let event = TransportEvent::LocalCandidate {
                peer: *peer,
                candidate: Candidate { addr: *addr },
            };
            if self.inner.events.try_send(event).is_err() {
                warn!(peer = %peer, "event queue full, candidate not trickled");
                return;
            }
        }
    }
}

fn reachable_form(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

impl QuicInner {
    async fn accept_loop(self: Arc<Self>) {
        while let Some(incoming) = self.endpoint.accept().await {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(err) = inner.handle_incoming(incoming).await {
                    debug!(error = %err, "inbound connection rejected");
                }
            });
        }
    }

    async fn handle_incoming(self: Arc<Self>, incoming: Incoming) -> Result<()> {
        let remote = incoming.remote_address();
        let connection = incoming.await.context("handshake failed")?;
        let public_key = extract_verified_key(&connection)
            .ok_or_else(|| anyhow!("{remote} presented no usable Ed25519 key"))?;
        let peer = public_key.peer_id();

        if !lock(&self.negotiations).contains_key(&peer) {
            connection.close(1u32.into(), b"unexpected");
            bail!("no open negotiation with {peer} ({remote})");
        }

        let (send, recv) = tokio::time::timeout(DIAL_TIMEOUT, connection.accept_bi())
            .await
            .map_err(|_| anyhow!("{peer} never opened a stream"))?
            .context("failed to accept stream")?;

        trace!(peer = %peer, addr = %remote, "accepted inbound channel");
        self.open_channel(peer, connection, send, recv).await;
        Ok(())
    }

    async fn dial(self: Arc<Self>, peer: PeerId) {
        let mut tried: HashSet<SocketAddr> = HashSet::new();
        let mut last_error = String::from("no candidate address");

        loop {
            // Re-read the list each round so late candidates are picked up.
            let next = match lock(&self.negotiations).get(&peer) {
                Some(addrs) => addrs.iter().find(|a| !tried.contains(*a)).copied(),
                None => return,
            };
            let Some(addr) = next else {
                break;
            };
            tried.insert(addr);

            match self.connect(&peer, addr).await {
                Ok((connection, send, recv)) => {
                    trace!(peer = %peer, addr = %addr, "dialed channel");
                    self.open_channel(peer, connection, send, recv).await;
                    return;
                }
                Err(err) => {
                    debug!(peer = %peer, addr = %addr, error = %err, "dial attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        if lock(&self.negotiations).remove(&peer).is_some() {
            let _ = self
                .events
                .send(TransportEvent::Failed {
                    peer,
                    reason: last_error,
                })
                .await;
        }
    }

    async fn connect(
        &self,
        peer: &PeerId,
        addr: SocketAddr,
    ) -> Result<(Connection, SendStream, RecvStream)> {
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &peer_id_to_sni(peer))
            .with_context(|| format!("failed to initiate connection to {addr}"))?;
        let connection = tokio::time::timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| anyhow!("connection to {addr} timed out"))?
            .with_context(|| format!("failed to establish connection to {addr}"))?;

        match extract_verified_key(&connection) {
            Some(key) if key.peer_id() == *peer => {}
            _ => {
                connection.close(1u32.into(), b"identity mismatch");
                bail!("{addr} is not {peer}");
            }
        }

        let (mut send, recv) = connection.open_bi().await.context("failed to open stream")?;
        send.write_all(&0u32.to_be_bytes())
            .await
            .context("failed to open stream")?;
        Ok((connection, send, recv))
    }

    async fn open_channel(
        self: &Arc<Self>,
        peer: PeerId,
        connection: Connection,
        send: SendStream,
        recv: RecvStream,
    ) {
        lock(&self.negotiations).remove(&peer);

        let (writer, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let stable_id = connection.stable_id();
        let previous = lock(&self.channels).insert(
            peer,
            PeerChannel {
                writer,
                connection: connection.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.connection.close(0u32.into(), b"replaced");
        }

        let _ = self.events.send(TransportEvent::Connected { peer }).await;

        tokio::spawn(write_loop(send, rx));
        tokio::spawn(self.clone().read_loop(peer, stable_id, recv));
    }

    async fn read_loop(self: Arc<Self>, peer: PeerId, stable_id: usize, mut recv: RecvStream) {
        let reason = loop {
            match read_frame(&mut recv).await {
                Ok(Some(data)) if data.is_empty() => continue,
                Ok(Some(data)) => {
                    if self.events.send(TransportEvent::Frame { peer, data }).await.is_err() {
                        break "event channel closed".to_string();
                    }
                }
                Ok(None) => break "stream finished".to_string(),
                Err(err) => break err.to_string(),
            }
        };

        let removed = {
            let mut channels = lock(&self.channels);
            match channels.get(&peer) {
                Some(channel) if channel.connection.stable_id() == stable_id => {
                    channels.remove(&peer)
                }
                _ => None,
            }
        };
        if let Some(channel) = removed {
            channel.connection.close(0u32.into(), b"stream closed");
            debug!(peer = %peer, reason = %reason, "channel closed");
            let _ = self.events.send(TransportEvent::Closed { peer, reason }).await;
        }
    }
}

async fn read_frame(recv: &mut RecvStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {len} bytes exceeds {MAX_FRAME_SIZE}");
    }
    let mut data = vec![0u8; len];
    recv.read_exact(&mut data).await?;
    Ok(Some(data))
}

async fn write_loop(mut send: SendStream, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        let len = frame.len() as u32;
        let written = async {
            send.write_all(&len.to_be_bytes()).await?;
            send.write_all(&frame).await
        }
        .await;
        if let Err(err) = written {
            trace!(error = %err, "write loop stopped");
            return;
        }
    }
    let _ = send.finish();
}

#[async_trait]
impl PeerTransport for QuicTransport {
    async fn create_offer(&self, peer: &PeerId) -> Result<SessionDescription> {
        lock(&self.inner.negotiations).insert(*peer, Vec::new());
        self.trickle_candidates(peer);
        Ok(self.description())
    }

    async fn accept_offer(&self, peer: &PeerId, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.public_key.peer_id() != *peer {
            bail!("offer key does not belong to {peer}");
        }
        lock(&self.inner.negotiations).insert(*peer, offer.addrs);
        self.trickle_candidates(peer);
        Ok(self.description())
    }

    async fn accept_answer(&self, peer: &PeerId, answer: SessionDescription) -> Result<()> {
        if answer.public_key.peer_id() != *peer {
            bail!("answer key does not belong to {peer}");
        }
        {
            let mut negotiations = lock(&self.inner.negotiations);
            let addrs = negotiations
                .get_mut(peer)
                .ok_or_else(|| anyhow!("no offer outstanding for {peer}"))?;
            for addr in answer.addrs {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        tokio::spawn(self.inner.clone().dial(*peer));
        Ok(())
    }

    async fn add_candidate(&self, peer: &PeerId, candidate: Candidate) -> Result<()> {
        if let Some(addrs) = lock(&self.inner.negotiations).get_mut(peer)
            && !addrs.contains(&candidate.addr)
        {
            addrs.push(candidate.addr);
        }
        Ok(())
    }

    fn send(&self, peer: &PeerId, frame: Vec<u8>) -> bool {
        if frame.len() > MAX_FRAME_SIZE {
            warn!(peer = %peer, len = frame.len(), "refusing oversized frame");
            return false;
        }
        match lock(&self.inner.channels).get(peer) {
            Some(channel) => channel.writer.try_send(frame).is_ok(),
            None => false,
        }
    }

    async fn close(&self, peer: &PeerId) {
        lock(&self.inner.negotiations).remove(peer);
        if let Some(channel) = lock(&self.inner.channels).remove(peer) {
            channel.connection.close(0u32.into(), b"closed");
        }
    }

    fn shutdown(&self) {
        self.inner.endpoint.close(0u32.into(), b"shutdown");
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryNetworkState {
    endpoints: HashMap<PeerId, TransportEvents>,
    offers: HashSet<(PeerId, PeerId)>,
    links: HashSet<(PeerId, PeerId)>,
    unreachable: HashSet<PeerId>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Shared switchboard for [`MemoryTransport`]s in one process.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MemoryNetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, public_key: PublicKey, events: TransportEvents) -> MemoryTransport {
        let local_id = public_key.peer_id();
        lock(&self.state).endpoints.insert(local_id, events.clone());
        MemoryTransport {
            network: self.clone(),
            local_id,
            public_key,
            events,
        }
    }

    /// Channels to or from an unreachable peer fail to open.
    pub fn set_unreachable(&self, peer: PeerId, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(peer);
        } else {
            state.unreachable.remove(&peer);
        }
    }

    /// Tear down the link between `a` and `b` as a transport failure would.
    pub fn break_link(&self, a: PeerId, b: PeerId) -> bool {
        let mut state = lock(&self.state);
        if !state.links.remove(&link_key(a, b)) {
            return false;
        }
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(events) = state.endpoints.get(&local) {
                let _ = events.try_send(TransportEvent::Closed {
                    peer: remote,
                    reason: "link broken".into(),
                });
            }
        }
        true
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        lock(&self.state).links.contains(&link_key(a, b))
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_id: PeerId,
    public_key: PublicKey,
    events: TransportEvents,
}

impl MemoryTransport {
    fn description(&self) -> SessionDescription {
        SessionDescription {
            public_key: self.public_key,
            addrs: Vec::new(),
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self, peer: &PeerId) -> Result<SessionDescription> {
        lock(&self.network.state).offers.insert((self.local_id, *peer));
        Ok(self.description())
    }

    async fn accept_offer(&self, peer: &PeerId, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.public_key.peer_id() != *peer {
            bail!("offer key does not belong to {peer}");
        }
        Ok(self.description())
    }

    async fn accept_answer(&self, peer: &PeerId, answer: SessionDescription) -> Result<()> {
        if answer.public_key.peer_id() != *peer {
            bail!("answer key does not belong to {peer}");
        }
        let mut state = lock(&self.network.state);
        if !state.offers.remove(&(self.local_id, *peer)) {
            bail!("no offer outstanding for {peer}");
        }

        let reachable = !state.unreachable.contains(peer)
            && !state.unreachable.contains(&self.local_id)
            && state.endpoints.contains_key(peer);
        if !reachable {
            let _ = self.events.try_send(TransportEvent::Failed {
                peer: *peer,
                reason: "peer unreachable".into(),
            });
            return Ok(());
        }

        state.links.insert(link_key(self.local_id, *peer));
        let _ = self.events.try_send(TransportEvent::Connected { peer: *peer });
        if let Some(remote) = state.endpoints.get(peer) {
            let _ = remote.try_send(TransportEvent::Connected { peer: self.local_id });
        }
        Ok(())
    }

    async fn add_candidate(&self, _peer: &PeerId, _candidate: Candidate) -> Result<()> {
        Ok(())
    }

    fn send(&self, peer: &PeerId, frame: Vec<u8>) -> bool {
        let state = lock(&self.network.state);
        if !state.links.contains(&link_key(self.local_id, *peer)) {
            return false;
        }
        match state.endpoints.get(peer) {
            Some(remote) => remote
                .try_send(TransportEvent::Frame {
                    peer: self.local_id,
                    data: frame,
                })
                .is_ok(),
            None => false,
        }
    }

    async fn close(&self, peer: &PeerId) {
        let mut state = lock(&self.network.state);
        state.offers.remove(&(self.local_id, *peer));
        if state.links.remove(&link_key(self.local_id, *peer))
            && let Some(remote) = state.endpoints.get(peer)
        {
            let _ = remote.try_send(TransportEvent::Closed {
                peer: self.local_id,
                reason: "closed by peer".into(),
            });
        }
    }

    fn shutdown(&self) {
        let mut state = lock(&self.network.state);
        state.endpoints.remove(&self.local_id);
        let local = self.local_id;
        let linked: Vec<PeerId> = state
            .links
            .iter()
            .filter_map(|(a, b)| match (*a == local, *b == local) {
                (true, _) => Some(*b),
                (_, true) => Some(*a),
                _ => None,
            })
            .collect();
        for peer in linked {
            state.links.remove(&link_key(local, peer));
            if let Some(remote) = state.endpoints.get(&peer) {
                let _ = remote.try_send(TransportEvent::Closed {
                    peer: local,
                    reason: "peer shut down".into(),
                });
            }
        }
    }
}
