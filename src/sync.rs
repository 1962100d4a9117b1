//! Anti-entropy comment sync.
//!
//! Every `sync_interval` each connected peer is asked for the comments it
//! holds in every joined room, newer than the last time we asked it.
//!
//! Responses are paged by count and size. A page flagged `more` is followed
//! by a request starting at its last `created_at`. The peer's cursor moves to
//! the time the cycle started only once the final page of every room has
//! arrived; a cycle that stalls for two intervals is dropped and the next one
//! starts again from the old cursor. Only one cycle per peer is in flight.
//!
//! Gossip gets comments around quickly; this loop is what guarantees that two
//! connected peers end up with the same store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::comment::{Comment, MergeOutcome};
use crate::identity::{PeerId, now_ms};
use crate::messages::PeerMessageBody;
use crate::protocols::PeerSender;
use crate::storage::CommentStore;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_COMMENTS_PER_RESPONSE: usize = 500;
/// Encoded comments per response page; well under the frame limit.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

const EVENT_DEPTH: usize = 256;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub sync_interval: Duration,
    pub max_comments_per_response: usize,
    pub max_response_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_comments_per_response: DEFAULT_MAX_COMMENTS_PER_RESPONSE,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// What the UI sees.
#[derive(Clone, Debug, PartialEq)]
pub enum CommentEvent {
    /// Comments that became visible or changed in `room_id`.
    Merged { room_id: String, comments: Vec<Comment> },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub requests_sent: u64,
    pub responses_served: u64,
    pub comments_merged: u64,
    pub comments_rejected: u64,
}

enum Command {
    JoinRoom(String, oneshot::Sender<usize>),
    LeaveRoom(String),
    PeerConnected(PeerId),
    SyncNow(oneshot::Sender<usize>),
    Request(PeerId, String, u64),
    Response(PeerId, String, Vec<Comment>, bool, oneshot::Sender<Result<Vec<Comment>>>),
    Pushed(PeerId, Comment, oneshot::Sender<Result<Vec<Comment>>>),
    Ingest(String, Vec<Comment>, oneshot::Sender<Result<Vec<Comment>>>),
    Stats(oneshot::Sender<SyncStats>),
    Quit,
}

#[derive(Clone)]
pub struct CommentSyncEngine {
    cmd_tx: mpsc::Sender<Command>,
}

/// A sync cycle waiting for its final pages.
struct InFlight {
    /// Becomes the peer's cursor once every room is complete.
    started_ms: u64,
    sent_at: Instant,
    rooms: HashSet<String>,
}

struct SyncActor<S: PeerSender> {
    store: CommentStore,
    sender: S,
    config: SyncConfig,
    rooms: BTreeSet<String>,
    in_flight: HashMap<PeerId, InFlight>,
    events_tx: mpsc::Sender<CommentEvent>,
    stats: SyncStats,
}

impl CommentSyncEngine {
    pub fn new<S: PeerSender>(
        store: CommentStore,
        sender: S,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<CommentEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(EVENT_DEPTH);
        let actor = SyncActor {
            store,
            sender,
            config,
            rooms: BTreeSet::new(),
            in_flight: HashMap::new(),
            events_tx,
            stats: SyncStats::default(),
        };
        tokio::spawn(actor.run(cmd_rx));
        (Self { cmd_tx }, events_rx)
    }

    /// Start syncing `room_id`: full sync (`since = 0`) with every connected
    /// peer. Returns how many requests went out.
    pub async fn join_room(&self, room_id: &str) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::JoinRoom(room_id.to_string(), tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn leave_room(&self, room_id: &str) {
        let _ = self.cmd_tx.send(Command::LeaveRoom(room_id.to_string())).await;
    }

    /// Initial sync on a freshly opened channel.
    pub async fn peer_connected(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerConnected(peer)).await;
    }

    /// Run one sync cycle now. Returns how many requests went out.
    pub async fn sync_now(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SyncNow(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn handle_sync_request(&self, from: PeerId, room_id: String, since: u64) {
        let _ = self.cmd_tx.send(Command::Request(from, room_id, since)).await;
    }

    /// Merge one page a peer sent back and ask for the next one when `more`
    /// is set. Returns the comments that became visible or changed.
    pub async fn handle_sync_response(
        &self,
        from: PeerId,
        room_id: String,
        comments: Vec<Comment>,
        more: bool,
    ) -> Result<Vec<Comment>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Response(from, room_id, comments, more, tx))
            .await
            .map_err(|_| anyhow!("sync engine stopped"))?;
        rx.await.map_err(|_| anyhow!("sync engine stopped"))?
    }

    /// A single comment pushed outside a sync exchange (`new-comment`,
    /// gossip). Same checks as a sync response.
    pub async fn handle_pushed(&self, from: PeerId, comment: Comment) -> Result<Vec<Comment>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Pushed(from, comment, tx))
            .await
            .map_err(|_| anyhow!("sync engine stopped"))?;
        rx.await.map_err(|_| anyhow!("sync engine stopped"))?
    }

    /// Merge comments that arrived some other way (local post, gossip) and
    /// notify the UI about the ones that changed.
    pub async fn ingest(&self, room_id: &str, comments: Vec<Comment>) -> Result<Vec<Comment>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Ingest(room_id.to_string(), comments, tx))
            .await
            .map_err(|_| anyhow!("sync engine stopped"))?;
        rx.await.map_err(|_| anyhow!("sync engine stopped"))?
    }

    pub async fn stats(&self) -> SyncStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).await.is_err() {
            return SyncStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<S: PeerSender> SyncActor<S> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::JoinRoom(room, reply)) => {
                        let sent = self.join_room(room).await;
                        let _ = reply.send(sent);
                    }
                    Some(Command::LeaveRoom(room)) => {
                        self.leave_room(&room).await;
                    }
                    Some(Command::PeerConnected(peer)) => {
                        // A new channel; pages of an earlier one are gone.
                        self.in_flight.remove(&peer);
                        self.sync_peer(peer).await;
                    }
                    Some(Command::SyncNow(reply)) => {
                        let _ = reply.send(self.sync_all().await);
                    }
                    Some(Command::Request(from, room, since)) => {
                        self.serve(from, room, since).await;
                    }
                    Some(Command::Response(from, room, comments, more, reply)) => {
                        let _ = reply.send(self.accept_response(from, room, comments, more).await);
                    }
                    Some(Command::Pushed(from, comment, reply)) => {
                        let room = comment.room_id.clone();
                        let _ = reply.send(self.accept_pushed(from, room, comment).await);
                    }
                    Some(Command::Ingest(room, comments, reply)) => {
                        let _ = reply.send(self.merge(&room, comments).await);
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.stats);
                    }
                    Some(Command::Quit) | None => break,
                },
                _ = ticker.tick() => {
                    let sent = self.sync_all().await;
                    trace!(requests = sent, "periodic sync");
                }
            }
        }
        debug!("sync engine stopped");
    }

    async fn join_room(&mut self, room: String) -> usize {
        if !self.rooms.insert(room.clone()) {
            return 0;
        }
        let mut sent = 0;
        for peer in self.sender.connected_peers().await {
            if self.request(peer, &room, 0).await {
                sent += 1;
            }
        }
        info!(room = %room, requests = sent, "full sync for new room");
        sent
    }

    async fn leave_room(&mut self, room: &str) {
        self.rooms.remove(room);
        let peers: Vec<PeerId> = self.in_flight.keys().copied().collect();
        for peer in peers {
            self.complete_room(peer, room).await;
        }
    }

    /// The cursor is the later of the session value and the persisted one.
    async fn cursor(&self, peer: &PeerId) -> u64 {
        let persisted = match self.store.last_sync(peer).await {
            Ok(at) => at,
            Err(err) => {
                warn!(peer = %peer, error = %err, "could not read sync cursor");
                0
            }
        };
        self.sender.last_sync(peer).await.unwrap_or(0).max(persisted)
    }

    async fn advance_cursor(&self, peer: &PeerId, at_ms: u64) {
        self.sender.set_last_sync(peer, at_ms).await;
        if let Err(err) = self.store.set_last_sync(peer, at_ms).await {
            warn!(peer = %peer, error = %err, "could not persist sync cursor");
        }
    }

    async fn sync_peer(&mut self, peer: PeerId) -> usize {
        if self.rooms.is_empty() {
            return 0;
        }
        if let Some(cycle) = self.in_flight.get(&peer) {
            if cycle.sent_at.elapsed() < self.config.sync_interval * 2 {
                trace!(peer = %peer, "sync cycle still in flight");
                return 0;
            }
            debug!(peer = %peer, pending = cycle.rooms.len(), "sync cycle stalled, starting over");
            self.in_flight.remove(&peer);
        }

        let since = self.cursor(&peer).await;
        let started_ms = now_ms();
        let rooms: Vec<String> = self.rooms.iter().cloned().collect();
        let mut pending = HashSet::new();
        for room in rooms {
            if self.request(peer, &room, since).await {
                pending.insert(room);
            }
        }
        let sent = pending.len();
        if sent > 0 {
            self.in_flight.insert(
                peer,
                InFlight {
                    started_ms,
                    sent_at: Instant::now(),
                    rooms: pending,
                },
            );
        }
        sent
    }

    /// The final page for `room` arrived from `peer`.
    async fn complete_room(&mut self, peer: PeerId, room: &str) {
        let Some(cycle) = self.in_flight.get_mut(&peer) else {
            return;
        };
        cycle.rooms.remove(room);
        if !cycle.rooms.is_empty() {
            return;
        }
        let started_ms = cycle.started_ms;
        self.in_flight.remove(&peer);
        self.advance_cursor(&peer, started_ms).await;
        debug!(peer = %peer, cursor = started_ms, "sync cycle complete");
    }

    async fn sync_all(&mut self) -> usize {
        let mut sent = 0;
        for peer in self.sender.connected_peers().await {
            sent += self.sync_peer(peer).await;
        }
        sent
    }

    async fn request(&mut self, peer: PeerId, room: &str, since: u64) -> bool {
        let body = PeerMessageBody::SyncRequest {
            room_id: room.to_string(),
            since,
        };
        let sent = self.sender.send_to_peer(&peer, body).await;
        if sent {
            self.stats.requests_sent += 1;
            debug!(peer = %peer, room = %room, since, "sync requested");
        }
        sent
    }

    async fn serve(&mut self, from: PeerId, room: String, since: u64) {
        let page = match self
            .store
            .comments_page(
                &room,
                since,
                self.config.max_comments_per_response,
                self.config.max_response_bytes,
            )
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(peer = %from, room = %room, error = %err, "could not load comments for sync");
                return;
            }
        };
        let count = page.comments.len();
        let more = page.more;
        let body = PeerMessageBody::SyncResponse {
            room_id: room.clone(),
            comments: page.comments,
            more,
        };
        if self.sender.send_to_peer(&from, body).await {
            self.stats.responses_served += 1;
            debug!(peer = %from, room = %room, since, count, more, "sync served");
        }
    }

    async fn accept_response(
        &mut self,
        from: PeerId,
        room: String,
        comments: Vec<Comment>,
        more: bool,
    ) -> Result<Vec<Comment>> {
        if !self.rooms.contains(&room) {
            debug!(peer = %from, room = %room, "sync response for a room we are not in");
            return Ok(Vec::new());
        }
        let next = comments.iter().map(|c| c.created_at).max();
        let merged = self.merge(&room, comments).await?;
        debug!(peer = %from, room = %room, merged = merged.len(), more, "sync response applied");

        match next {
            Some(since) if more => {
                if !self.request(from, &room, since).await {
                    debug!(peer = %from, room = %room, "could not ask for the next page");
                }
            }
            _ => self.complete_room(from, &room).await,
        }
        Ok(merged)
    }

    async fn accept_pushed(&mut self, from: PeerId, room: String, comment: Comment) -> Result<Vec<Comment>> {
        if !self.rooms.contains(&room) {
            trace!(peer = %from, room = %room, "pushed comment for a room we are not in");
            return Ok(Vec::new());
        }
        self.merge(&room, vec![comment]).await
    }

    /// Verify, upsert and announce. Comments for other rooms or that fail
    /// verification are skipped and counted.
    async fn merge(&mut self, room: &str, comments: Vec<Comment>) -> Result<Vec<Comment>> {
        let mut changed = Vec::new();
        let mut seen = HashSet::new();
        for comment in comments {
            if comment.room_id != room {
                self.stats.comments_rejected += 1;
                continue;
            }
            if let Err(err) = comment.verify() {
                self.stats.comments_rejected += 1;
                warn!(room = %room, error = %err, "rejecting comment");
                continue;
            }
            let (merged, outcome) = self.store.upsert(comment).await?;
            if outcome != MergeOutcome::Unchanged && seen.insert(merged.id) {
                changed.push(merged);
            }
        }

        if !changed.is_empty() {
            self.stats.comments_merged += changed.len() as u64;
            let event = CommentEvent::Merged {
                room_id: room.to_string(),
                comments: changed.clone(),
            };
            if self.events_tx.try_send(event).is_err() {
                warn!(room = %room, "comment event queue full");
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::CommentDraft;
    use crate::identity::Keypair;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const ROOM: &str = "https://example.com/page";

    #[derive(Clone, Default)]
    struct RecordingSender {
        connected: Arc<Mutex<Vec<PeerId>>>,
        sent: Arc<Mutex<Vec<(PeerId, PeerMessageBody)>>>,
        cursors: Arc<Mutex<HashMap<PeerId, u64>>>,
    }

    impl RecordingSender {
        fn connect(&self, peer: PeerId) {
            self.connected.lock().unwrap().push(peer);
        }

        fn sync_requests(&self) -> Vec<(PeerId, String, u64)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(peer, body)| match body {
                    PeerMessageBody::SyncRequest { room_id, since } => Some((*peer, room_id.clone(), *since)),
                    _ => None,
                })
                .collect()
        }

        fn drain(&self) -> Vec<(PeerId, PeerMessageBody)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn sync_responses(&self) -> Vec<(PeerId, Vec<Comment>)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(peer, body)| match body {
                    PeerMessageBody::SyncResponse { comments, .. } => Some((*peer, comments.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl PeerSender for RecordingSender {
        async fn send_to_peer(&self, peer: &PeerId, body: PeerMessageBody) -> bool {
            if !self.connected.lock().unwrap().contains(peer) {
                return false;
            }
            self.sent.lock().unwrap().push((*peer, body));
            true
        }

        async fn connected_peers(&self) -> Vec<PeerId> {
            self.connected.lock().unwrap().clone()
        }

        async fn last_sync(&self, peer: &PeerId) -> Option<u64> {
            self.cursors.lock().unwrap().get(peer).copied()
        }

        async fn set_last_sync(&self, peer: &PeerId, at_ms: u64) {
            self.cursors.lock().unwrap().insert(*peer, at_ms);
        }
    }

    fn store() -> CommentStore {
        CommentStore::new(Arc::new(MemoryStore::new()))
    }

    fn comment(author: &Keypair, text: &str, created_at: u64) -> Comment {
        let draft = CommentDraft {
            room_id: ROOM.into(),
            text: text.into(),
            ..Default::default()
        };
        Comment::create_at(author, draft, created_at).unwrap()
    }

    #[tokio::test]
    async fn joining_a_room_requests_full_sync() {
        let sender = RecordingSender::default();
        let peer = Keypair::generate().peer_id();
        sender.connect(peer);
        let (engine, _events) = CommentSyncEngine::new(store(), sender.clone(), SyncConfig::default());

        assert_eq!(engine.join_room(ROOM).await, 1);
        assert_eq!(engine.join_room(ROOM).await, 0);
        assert_eq!(sender.sync_requests(), vec![(peer, ROOM.to_string(), 0)]);
    }

    #[tokio::test]
    async fn cursor_moves_to_cycle_start_once_the_final_page_arrives() {
        let sender = RecordingSender::default();
        let peer = Keypair::generate().peer_id();
        let comments = store();
        let (engine, _events) = CommentSyncEngine::new(comments.clone(), sender.clone(), SyncConfig::default());
        engine.join_room(ROOM).await;

        sender.connect(peer);
        let before = now_ms();
        engine.peer_connected(peer).await;
        // One cycle per peer at a time.
        assert_eq!(engine.sync_now().await, 0);
        assert_eq!(comments.last_sync(&peer).await.unwrap(), 0);

        engine.handle_sync_response(peer, ROOM.into(), Vec::new(), false).await.unwrap();
        let persisted = comments.last_sync(&peer).await.unwrap();
        assert!(persisted >= before);
        assert_eq!(sender.cursors.lock().unwrap().get(&peer).copied(), Some(persisted));

        assert_eq!(engine.sync_now().await, 1);
        let requests = sender.sync_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].2, 0);
        assert_eq!(requests[1].2, persisted);
    }

    #[tokio::test]
    async fn paged_responses_fetch_everything_before_the_cursor_moves() {
        let config = SyncConfig {
            max_comments_per_response: 2,
            ..SyncConfig::default()
        };
        let client_id = Keypair::generate().peer_id();
        let server_id = Keypair::generate().peer_id();

        let server_store = store();
        let author = Keypair::generate();
        for i in 0..5 {
            server_store
                .upsert(comment(&author, &format!("c{i}"), 1_000 + i))
                .await
                .unwrap();
        }
        let server_sender = RecordingSender::default();
        server_sender.connect(client_id);
        let (server, _server_events) = CommentSyncEngine::new(server_store, server_sender.clone(), config.clone());

        let client_store = store();
        let client_sender = RecordingSender::default();
        let (client, _client_events) = CommentSyncEngine::new(client_store.clone(), client_sender.clone(), config);
        client.join_room(ROOM).await;
        client_sender.connect(server_id);
        client.peer_connected(server_id).await;

        let mut pages = Vec::new();
        for _ in 0..10 {
            for (_, body) in client_sender.drain() {
                if let PeerMessageBody::SyncRequest { room_id, since } = body {
                    server.handle_sync_request(client_id, room_id, since).await;
                }
            }
            server.stats().await;
            let responses = server_sender.drain();
            if responses.is_empty() {
                break;
            }
            for (_, body) in responses {
                if let PeerMessageBody::SyncResponse { room_id, comments, more } = body {
                    assert!(comments.len() <= 2);
                    if more {
                        assert_eq!(client_store.last_sync(&server_id).await.unwrap(), 0);
                    }
                    pages.push(more);
                    client.handle_sync_response(server_id, room_id, comments, more).await.unwrap();
                }
            }
        }

        assert_eq!(pages, vec![true, true, false]);
        assert_eq!(client_store.count().await.unwrap(), 5);
        assert!(client_store.last_sync(&server_id).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn persisted_cursor_survives_a_new_session() {
        let peer = Keypair::generate().peer_id();
        let comments = store();
        comments.set_last_sync(&peer, 1_234).await.unwrap();

        let sender = RecordingSender::default();
        sender.connect(peer);
        let (engine, _events) = CommentSyncEngine::new(comments, sender.clone(), SyncConfig::default());
        engine.join_room(ROOM).await;
        engine.peer_connected(peer).await;
        engine.stats().await;

        assert_eq!(sender.sync_requests()[1], (peer, ROOM.to_string(), 1_234));
    }

    #[tokio::test]
    async fn requests_are_served_with_newer_comments() {
        let sender = RecordingSender::default();
        let peer = Keypair::generate().peer_id();
        sender.connect(peer);
        let comments = store();
        let author = Keypair::generate();
        comments.upsert(comment(&author, "old", 1_000)).await.unwrap();
        comments.upsert(comment(&author, "new", 3_000)).await.unwrap();

        let config = SyncConfig {
            max_comments_per_response: 10,
            ..SyncConfig::default()
        };
        let (engine, _events) = CommentSyncEngine::new(comments, sender.clone(), config);
        engine.handle_sync_request(peer, ROOM.into(), 2_000).await;
        engine.stats().await;

        let responses = sender.sync_responses();
        assert_eq!(responses.len(), 1);
        let texts: Vec<&str> = responses[0].1.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["new"]);
    }

    #[tokio::test]
    async fn responses_merge_idempotently_and_emit_events() {
        let sender = RecordingSender::default();
        let peer = Keypair::generate().peer_id();
        let comments = store();
        let (engine, mut events) = CommentSyncEngine::new(comments.clone(), sender, SyncConfig::default());
        engine.join_room(ROOM).await;

        let author = Keypair::generate();
        let c = comment(&author, "hello", now_ms());
        let merged = engine
            .handle_sync_response(peer, ROOM.into(), vec![c.clone(), c.clone()], false)
            .await
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            CommentEvent::Merged {
                room_id: ROOM.into(),
                comments: vec![c.clone()],
            }
        );

        let again = engine.handle_sync_response(peer, ROOM.into(), vec![c.clone()], false).await.unwrap();
        assert!(again.is_empty());
        assert!(events.try_recv().is_err());
        assert_eq!(comments.room_comments(ROOM).await.unwrap(), vec![c]);
    }

    #[tokio::test]
    async fn votes_in_a_response_count_as_changes() {
        let sender = RecordingSender::default();
        let peer = Keypair::generate().peer_id();
        let (engine, mut events) = CommentSyncEngine::new(store(), sender, SyncConfig::default());
        engine.join_room(ROOM).await;

        let author = Keypair::generate();
        let c = comment(&author, "vote for me", now_ms());
        engine.handle_sync_response(peer, ROOM.into(), vec![c.clone()], false).await.unwrap();
        events.recv().await.unwrap();

        let mut voted = c.clone();
        voted.apply_vote(c.vote(&Keypair::generate()).unwrap());
        let merged = engine.handle_sync_response(peer, ROOM.into(), vec![voted], false).await.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].upvotes(), 1);
    }

    #[tokio::test]
    async fn forged_and_foreign_comments_are_rejected() {
        let sender = RecordingSender::default();
        let peer = Keypair::generate().peer_id();
        let comments = store();
        let (engine, _events) = CommentSyncEngine::new(comments.clone(), sender, SyncConfig::default());
        engine.join_room(ROOM).await;

        let author = Keypair::generate();
        let mut forged = comment(&author, "original", now_ms());
        forged.text = "rewritten".into();
        let mut foreign = comment(&author, "elsewhere", now_ms());
        foreign.room_id = "https://other.example/".into();

        let merged = engine
            .handle_sync_response(peer, ROOM.into(), vec![forged, foreign], false)
            .await
            .unwrap();
        assert!(merged.is_empty());
        assert_eq!(comments.count().await.unwrap(), 0);
        assert_eq!(engine.stats().await.comments_rejected, 2);
    }

    #[tokio::test]
    async fn responses_for_unjoined_rooms_are_ignored() {
        let sender = RecordingSender::default();
        let comments = store();
        let (engine, _events) = CommentSyncEngine::new(comments.clone(), sender, SyncConfig::default());

        let c = comment(&Keypair::generate(), "unsolicited", now_ms());
        let merged = engine
            .handle_sync_response(Keypair::generate().peer_id(), ROOM.into(), vec![c], false)
            .await
            .unwrap();
        assert!(merged.is_empty());
        assert_eq!(comments.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn timer_drives_periodic_sync() {
        let sender = RecordingSender::default();
        sender.connect(Keypair::generate().peer_id());
        let config = SyncConfig {
            sync_interval: Duration::from_millis(20),
            ..SyncConfig::default()
        };
        let (engine, _events) = CommentSyncEngine::new(store(), sender.clone(), config);
        engine.join_room(ROOM).await;

        // Nobody answers, so each cycle stalls and is retried.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let requests = sender.sync_requests();
        assert!(requests.len() >= 3);
        assert!(requests.iter().all(|(_, _, since)| *since == 0));
    }
}
