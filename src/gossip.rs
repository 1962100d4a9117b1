//! # Epidemic Gossip
//!
//! Floods signed comment, vote and deletion payloads across the mesh.
//!
//! ## Protocol Overview
//!
//! | Step | Action |
//! |------|--------|
//! | Publish | Mark seen, send to `fanout` random connected peers |
//! | Receive | Drop duplicates (ack only) and expired or invalid envelopes |
//! | Deliver | Hand the payload to the application, decrement `ttl` |
//! | Relay | While `ttl > 0`, forward to `fanout - 1` peers not on the path |
//! | Ack | Tell the sender the envelope arrived |
//!
//! Gossip is a latency optimization only. Delivery is probabilistic under
//! churn; the anti-entropy sync in [`crate::sync`] is what makes peers
//! converge.
//!
//! ## Bounds
//!
//! - The seen set and the pending-ack table are LRU-bounded and purged on a
//!   timer once entries are older than `seen_retention`.
//! - A message id is processed at most once per peer, so it is relayed at
//!   most once no matter how many copies arrive.
//! - Envelopes stamped further ahead than `max_clock_skew` are invalid, and a
//!   seen entry outlives the window in which its envelope could still be
//!   accepted. A replay after the purge is therefore always expired.
//! - An inbound `ttl` is clamped to `ttl_max`.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::identity::{PeerId, now_ms};
use crate::messages::{GossipEnvelope, GossipPayload, MessageId, PeerMessageBody};
use crate::protocols::PeerSender;

pub const DEFAULT_FANOUT: usize = 6;
pub const DEFAULT_TTL_MAX: u8 = 3;
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SEEN_RETENTION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_SEEN: usize = 10_000;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Longest visited path accepted on an inbound envelope.
pub const MAX_PATH_LEN: usize = 64;

const DELIVERY_DEPTH: usize = 1024;

#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub fanout: usize,
    pub ttl_max: u8,
    /// Envelopes older than this are dropped without an ack.
    pub message_timeout: Duration,
    pub seen_retention: Duration,
    pub max_seen: usize,
    pub cleanup_interval: Duration,
    /// How far ahead of the local clock an envelope may be stamped.
    pub max_clock_skew: Duration,
}

impl GossipConfig {
    /// Seen entries are kept at least until their envelope would be expired.
    fn effective_retention(&self) -> Duration {
        self.seen_retention
            .max(self.message_timeout + self.max_clock_skew)
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            ttl_max: DEFAULT_TTL_MAX,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            seen_retention: DEFAULT_SEEN_RETENTION,
            max_seen: DEFAULT_MAX_SEEN,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Originated here and sent to `sent` peers.
    Published { message_id: MessageId, sent: usize },
    /// Already seen; nothing was processed or relayed.
    Duplicate,
    Expired,
    Invalid,
    /// Delivered to the application and relayed to `relayed` peers.
    Delivered { relayed: usize },
}

/// A payload accepted from the network.
#[derive(Clone, Debug)]
pub struct GossipDelivery {
    pub from: PeerId,
    pub origin: PeerId,
    pub payload: GossipPayload,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GossipStats {
    pub messages_gossiped: u64,
    pub messages_relayed: u64,
    pub duplicates: u64,
    pub expired: u64,
    pub invalid: u64,
    pub acks_received: u64,
    pub pending_acks: usize,
    pub seen: usize,
}

enum Command {
    Publish(GossipPayload, oneshot::Sender<Result<GossipOutcome>>),
    Receive(PeerId, GossipEnvelope, oneshot::Sender<GossipOutcome>),
    Ack(PeerId, MessageId),
    Stats(oneshot::Sender<GossipStats>),
    Quit,
}

#[derive(Clone)]
pub struct GossipProtocol {
    cmd_tx: mpsc::Sender<Command>,
}

struct GossipActor<S: PeerSender> {
    local_id: PeerId,
    sender: S,
    config: GossipConfig,
    seen: LruCache<MessageId, Instant>,
    pending_acks: LruCache<(MessageId, PeerId), Instant>,
    delivery_tx: mpsc::Sender<GossipDelivery>,
    stats: GossipStats,
}

impl GossipProtocol {
    /// Spawn the gossip actor. Accepted payloads arrive on the returned
    /// receiver.
    pub fn new<S: PeerSender>(
        local_id: PeerId,
        sender: S,
        config: GossipConfig,
    ) -> (Self, mpsc::Receiver<GossipDelivery>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_DEPTH);
        let capacity = NonZeroUsize::new(config.max_seen).unwrap_or(NonZeroUsize::MIN);
        let actor = GossipActor {
            local_id,
            sender,
            seen: LruCache::new(capacity),
            pending_acks: LruCache::new(capacity),
            delivery_tx,
            config,
            stats: GossipStats::default(),
        };
        tokio::spawn(actor.run(cmd_rx));
        (Self { cmd_tx }, delivery_rx)
    }

    /// Originate `payload`. Publishing the same payload twice is a no-op the
    /// second time.
    pub async fn gossip(&self, payload: GossipPayload) -> Result<GossipOutcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(payload, tx))
            .await
            .map_err(|_| anyhow!("gossip stopped"))?;
        rx.await.map_err(|_| anyhow!("gossip stopped"))?
    }

    pub async fn handle_gossip(&self, from: PeerId, envelope: GossipEnvelope) -> GossipOutcome {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Receive(from, envelope, tx)).await.is_err() {
            return GossipOutcome::Invalid;
        }
        rx.await.unwrap_or(GossipOutcome::Invalid)
    }

    pub async fn handle_ack(&self, from: PeerId, message_id: MessageId) {
        let _ = self.cmd_tx.send(Command::Ack(from, message_id)).await;
    }

    pub async fn stats(&self) -> GossipStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).await.is_err() {
            return GossipStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

/// Unbiased sample of up to `amount` peers via a partial Fisher-Yates shuffle.
fn sample_peers(mut candidates: Vec<PeerId>, amount: usize) -> Vec<PeerId> {
    let amount = amount.min(candidates.len());
    let mut rng = rand::thread_rng();
    let (chosen, _) = candidates.partial_shuffle(&mut rng, amount);
    chosen.to_vec()
}

impl<S: PeerSender> GossipActor<S> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Publish(payload, reply)) => {
                        let _ = reply.send(self.publish(payload).await);
                    }
                    Some(Command::Receive(from, envelope, reply)) => {
                        let _ = reply.send(self.receive(from, envelope).await);
                    }
                    Some(Command::Ack(from, message_id)) => {
                        if self.pending_acks.pop(&(message_id, from)).is_some() {
                            self.stats.acks_received += 1;
                            trace!(peer = %from, message = %message_id, "gossip acknowledged");
                        }
                    }
                    Some(Command::Stats(reply)) => {
                        let mut stats = self.stats;
                        stats.pending_acks = self.pending_acks.len();
                        stats.seen = self.seen.len();
                        let _ = reply.send(stats);
                    }
                    Some(Command::Quit) | None => break,
                },
                _ = cleanup.tick() => self.cleanup(),
            }
        }
        debug!("gossip actor stopped");
    }

    async fn publish(&mut self, payload: GossipPayload) -> Result<GossipOutcome> {
        let created_at = now_ms();
        let message_id = MessageId::compute(&payload, &self.local_id, created_at)?;
        if self.seen.contains(&message_id) {
            return Ok(GossipOutcome::Duplicate);
        }
        self.seen.put(message_id, Instant::now());

        let envelope = GossipEnvelope {
            message_id,
            ttl: self.config.ttl_max,
            origin: self.local_id,
            path: vec![self.local_id],
            created_at,
            payload,
        };

        let sent = self.fan_out(&envelope, &[], self.config.fanout).await;
        self.stats.messages_gossiped += 1;
        debug!(message = %message_id, room = %envelope.payload.room_id(), sent, "gossip published");
        Ok(GossipOutcome::Published { message_id, sent })
    }

    async fn receive(&mut self, from: PeerId, mut envelope: GossipEnvelope) -> GossipOutcome {
        let message_id = envelope.message_id;

        if self.seen.contains(&message_id) {
            self.stats.duplicates += 1;
            trace!(peer = %from, message = %message_id, "duplicate gossip");
            self.ack(from, message_id).await;
            return GossipOutcome::Duplicate;
        }

        let now = now_ms();
        if envelope.created_at > now.saturating_add(self.config.max_clock_skew.as_millis() as u64) {
            self.stats.invalid += 1;
            warn!(
                peer = %from,
                message = %message_id,
                ahead_ms = envelope.created_at - now,
                "dropping gossip stamped in the future"
            );
            return GossipOutcome::Invalid;
        }

        let age = now.saturating_sub(envelope.created_at);
        if age > self.config.message_timeout.as_millis() as u64 {
            self.stats.expired += 1;
            trace!(peer = %from, message = %message_id, age_ms = age, "expired gossip");
            return GossipOutcome::Expired;
        }

        if !self.is_valid(&envelope) {
            self.stats.invalid += 1;
            warn!(peer = %from, message = %message_id, "dropping invalid gossip envelope");
            return GossipOutcome::Invalid;
        }

        self.seen.put(message_id, Instant::now());

        let delivery = GossipDelivery {
            from,
            origin: envelope.origin,
            payload: envelope.payload.clone(),
        };
        if self.delivery_tx.try_send(delivery).is_err() {
            warn!(message = %message_id, "gossip delivery queue full");
        }

        envelope.ttl = envelope.ttl.min(self.config.ttl_max).saturating_sub(1);
        envelope.path.push(self.local_id);

        let mut relayed = 0;
        if envelope.ttl > 0 {
            let mut exclude = envelope.path.clone();
            exclude.push(from);
            relayed = self
                .fan_out(&envelope, &exclude, self.config.fanout.saturating_sub(1))
                .await;
            if relayed > 0 {
                self.stats.messages_relayed += 1;
            }
        }
        debug!(peer = %from, message = %message_id, ttl = envelope.ttl, relayed, "gossip delivered");

        self.ack(from, message_id).await;
        GossipOutcome::Delivered { relayed }
    }

    fn is_valid(&self, envelope: &GossipEnvelope) -> bool {
        if envelope.path.is_empty() || envelope.path.len() > MAX_PATH_LEN {
            return false;
        }
        match MessageId::compute(&envelope.payload, &envelope.origin, envelope.created_at) {
            Ok(id) if id == envelope.message_id => envelope.payload.verify(),
            _ => false,
        }
    }

    async fn fan_out(&mut self, envelope: &GossipEnvelope, exclude: &[PeerId], amount: usize) -> usize {
        if amount == 0 {
            return 0;
        }
        let candidates: Vec<PeerId> = self
            .sender
            .connected_peers()
            .await
            .into_iter()
            .filter(|p| *p != self.local_id && !exclude.contains(p) && !envelope.path.contains(p))
            .collect();
        let targets = sample_peers(candidates, amount);

        let mut sent = 0;
        for peer in targets {
            let body = PeerMessageBody::Gossip {
                envelope: envelope.clone(),
            };
            if self.sender.send_to_peer(&peer, body).await {
                self.pending_acks.put((envelope.message_id, peer), Instant::now());
                sent += 1;
            }
        }
        sent
    }

    async fn ack(&self, to: PeerId, message_id: MessageId) {
        if !self
            .sender
            .send_to_peer(&to, PeerMessageBody::GossipAck { message_id })
            .await
        {
            trace!(peer = %to, message = %message_id, "could not ack gossip");
        }
    }

    fn cleanup(&mut self) {
        let retention = self.config.effective_retention();

        let stale: Vec<MessageId> = self
            .seen
            .iter()
            .filter(|(_, at)| at.elapsed() > retention)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.seen.pop(id);
        }

        let unacked: Vec<(MessageId, PeerId)> = self
            .pending_acks
            .iter()
            .filter(|(_, at)| at.elapsed() > retention)
            .map(|(key, _)| *key)
            .collect();
        for key in &unacked {
            self.pending_acks.pop(key);
        }

        if !stale.is_empty() || !unacked.is_empty() {
            debug!(seen = stale.len(), unacked = unacked.len(), "purged gossip state");
        }
    }
}
