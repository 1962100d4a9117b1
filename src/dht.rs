//! # Kademlia-style Distributed Hash Table
//!
//! Peer and content discovery for the mesh. Keys and peer ids share one 256-bit
//! space; closeness is XOR distance.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `find_node(target)` | Iterative lookup of the k peers closest to a target |
//! | `store(key, value)` | Store locally, then push to the k closest peers |
//! | `retrieve(key)` | Local hit, else query the closest peers in distance order |
//! | `announce_room` / `lookup_room` | Room roster under `room:<room_id>` |
//!
//! ## Routing Table
//!
//! 256 k-buckets indexed by the length of the common prefix with our own id.
//! A full bucket pings its least-recently-seen entry and only evicts it when
//! the ping fails. Entries are dropped whenever an RPC to them fails.
//!
//! RPCs are addressed by [`PeerId`] and carried over the mesh, so the routing
//! table only ever holds peers we have actually exchanged messages with.
//!
//! ## Actor Architecture
//!
//! - `DhtNode`: cloneable handle; lookups run on the caller's task
//! - `DhtNodeActor`: owns the routing table and the record cache
//! - Periodic tasks refresh stale buckets and republish local records

use std::collections::{BinaryHeap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::comment::CommentId;
use crate::error::NetworkError;
use crate::identity::{PeerId, distance_cmp, now_ms};
use crate::messages::{
    DhtRequest, DhtResponse, MAX_VALUE_SIZE, deserialize_bounded, serialize_record,
};
use crate::protocols::DhtRpc;
use crate::storage::{DHT_PARTITION, RecordStore, StorageError};

/// Key type for DHT storage (32-byte hash).
pub type Key = [u8; 32];

/// Domain prefix applied before hashing application keys into the key space.
const KEY_HASH_DOMAIN: &[u8] = b"seymour-dht-key-v1:";

/// Default Kademlia replication factor (bucket size).
pub const DEFAULT_K: usize = 20;

/// Default Kademlia concurrency factor (parallel queries per round).
pub const DEFAULT_ALPHA: usize = 3;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Hard stop for a lookup that keeps finding marginally closer peers.
const MAX_LOOKUP_ROUNDS: usize = 20;

/// Most peers kept in one room roster.
const MAX_ROSTER_PEERS: usize = 50;

/// Marks a value as a [`RoomRoster`], which merges instead of replacing.
const ROSTER_MAGIC: &[u8] = b"seymour-roster-v1:";

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
    pub lookup_timeout: Duration,
    pub republish_interval: Duration,
    /// Lifetime of records stored on behalf of other peers.
    pub record_ttl: Duration,
    /// How often due republishes and expirations are processed.
    pub maintenance_interval: Duration,
    pub bucket_refresh_interval: Duration,
    pub max_records: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            record_ttl: DEFAULT_RECORD_TTL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

/// Map an application key into the DHT key space.
pub fn hash_key(key: &[u8]) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(KEY_HASH_DOMAIN);
    hasher.update(key);
    *hasher.finalize().as_bytes()
}

pub fn room_key(room_id: &str) -> Vec<u8> {
    format!("room:{room_id}").into_bytes()
}

/// Where a signed comment is published, addressed by its content id.
pub fn comment_key(id: &CommentId) -> Vec<u8> {
    format!("comment:{}", id.to_hex()).into_bytes()
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Clone, Debug)]
struct RoutingEntry {
    peer_id: PeerId,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    /// Least recently seen first.
    entries: Vec<RoutingEntry>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full { oldest: PeerId },
}

#[derive(Clone, Debug)]
struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: PeerId,
    new_peer: PeerId,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn touch(&mut self, peer_id: PeerId, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.entries.iter().position(|e| e.peer_id == peer_id) {
            let mut existing = self.entries.remove(pos);
            existing.last_seen = Instant::now();
            self.entries.push(existing);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(RoutingEntry {
                peer_id,
                last_seen: Instant::now(),
            });
            self.mark_refreshed();
            BucketTouchOutcome::Inserted
        } else {
            match self.entries.first() {
                Some(oldest) => BucketTouchOutcome::Full {
                    oldest: oldest.peer_id,
                },
                // k == 0: nothing can ever be inserted.
                None => BucketTouchOutcome::Refreshed,
            }
        }
    }

    fn refresh(&mut self, peer_id: &PeerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.peer_id == peer_id) {
            let mut existing = self.entries.remove(pos);
            existing.last_seen = Instant::now();
            self.entries.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, peer_id: &PeerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.peer_id == peer_id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

fn random_id_for_bucket(self_id: &PeerId, bucket_idx: usize) -> PeerId {
    let self_bytes = self_id.as_bytes();

    let mut distance: [u8; 32] = rand::random();

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }

    PeerId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: (0..256).map(|_| RoutingBucket::new()).collect(),
        }
    }

    #[cfg(test)]
    pub fn update(&mut self, peer_id: PeerId) {
        let _ = self.update_with_pending(peer_id);
    }

    fn update_with_pending(&mut self, peer_id: PeerId) -> Option<PendingBucketUpdate> {
        if peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &peer_id);
        match self.buckets[idx].touch(peer_id, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full { oldest } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest,
                new_peer: peer_id,
            }),
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        if *peer_id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, peer_id);
        self.buckets[idx].remove(peer_id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn closest(&self, target: &PeerId, k: usize) -> Vec<PeerId> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistPeer {
            dist: [u8; 32],
            peer_id: PeerId,
        }

        impl Ord for DistPeer {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistPeer {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistPeer> = BinaryHeap::with_capacity(k + 1);

        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let dist = entry.peer_id.xor_distance(target);

                if heap.len() < k {
                    heap.push(DistPeer { dist, peer_id: entry.peer_id });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(DistPeer { dist, peer_id: entry.peer_id });
                    heap.pop();
                }
            }
        }

        let mut result: Vec<_> = heap.into_iter().map(|d| d.peer_id).collect();
        sort_by_distance(&mut result, target);
        result
    }

    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest);
            return;
        }

        let _ = bucket.remove(&pending.oldest);
        if bucket.entries.iter().any(|e| e.peer_id == pending.new_peer) {
            return;
        }
        if bucket.entries.len() < self.k {
            bucket.entries.push(RoutingEntry {
                peer_id: pending.new_peer,
                last_seen: Instant::now(),
            });
        }
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if bucket_idx < self.buckets.len() {
            self.buckets[bucket_idx].mark_refreshed();
        }
    }
}

fn sort_by_distance(peers: &mut [PeerId], target: &PeerId) {
    peers.sort_by(|a, b| distance_cmp(&a.xor_distance(target), &b.xor_distance(target)));
}

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOrigin {
    Local,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRecord {
    pub key_hash: Key,
    pub value: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub stored_at: u64,
    pub next_republish_at: u64,
    pub origin: RecordOrigin,
}

impl DhtRecord {
    fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        self.origin == RecordOrigin::Remote
            && now.saturating_sub(self.stored_at) > ttl.as_millis() as u64
    }
}

/// Peers that announced themselves in a room.
///
/// Every member announces under the same key, so copies of a roster are
/// merged wherever they meet: the union of entries, the newest announcement
/// per peer, stale entries dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRoster {
    pub room_id: String,
    pub peers: Vec<(PeerId, u64)>,
}

impl RoomRoster {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = ROSTER_MAGIC.to_vec();
        bytes.extend(serialize_record(self)?);
        Ok(bytes)
    }

    /// `None` when `bytes` is not a roster.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        deserialize_bounded(bytes.strip_prefix(ROSTER_MAGIC)?).ok()
    }

    pub fn merge(&mut self, other: RoomRoster, now: u64, ttl_ms: u64) {
        for (peer, at) in other.peers {
            match self.peers.iter_mut().find(|(known, _)| *known == peer) {
                Some(entry) => entry.1 = entry.1.max(at),
                None => self.peers.push((peer, at)),
            }
        }
        self.peers.retain(|(_, at)| now.saturating_sub(*at) <= ttl_ms);
        self.peers.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.peers.truncate(MAX_ROSTER_PEERS);
    }
}

/// Both values are rosters of the same room: their merge, encoded.
fn merge_roster_values(existing: &[u8], incoming: &[u8], now: u64, ttl_ms: u64) -> Option<Vec<u8>> {
    let mut merged = RoomRoster::decode(existing)?;
    let incoming = RoomRoster::decode(incoming)?;
    if merged.room_id != incoming.room_id {
        return None;
    }
    merged.merge(incoming, now, ttl_ms);
    merged.encode().ok()
}

/// What the actor did with a record.
#[derive(Debug, Default)]
struct PutOutcome {
    /// The record as now held, to be written through; `None` when refused.
    stored: Option<DhtRecord>,
    evicted: Option<Key>,
}

// ============================================================================
// Lookup results
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupState {
    Init,
    Querying,
    Converged,
    TimedOut,
}

#[derive(Clone, Debug)]
pub struct LookupResult {
    /// At most k peers, closest first.
    pub closest: Vec<PeerId>,
    pub state: LookupState,
    pub rounds: usize,
    pub elapsed: Duration,
}

impl LookupResult {
    /// The closest peers, or [`NetworkError::LookupTimeout`] when the lookup
    /// ran out of time before converging.
    pub fn require_converged(self) -> Result<Vec<PeerId>, NetworkError> {
        match self.state {
            LookupState::TimedOut => Err(NetworkError::LookupTimeout {
                elapsed_ms: self.elapsed.as_millis() as u64,
            }),
            _ => Ok(self.closest),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhtStats {
    pub routing_table_size: usize,
    pub records: usize,
}

// ============================================================================
// Node handle and actor
// ============================================================================

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: PeerId,
    config: DhtConfig,
    network: Arc<N>,
    store: Option<Arc<dyn RecordStore>>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            config: self.config.clone(),
            network: self.network.clone(),
            store: self.store.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtRpc> {
    routing: RoutingTable,
    records: LruCache<Key, DhtRecord>,
    config: DhtConfig,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: PeerId,
}

enum Command {
    ObservePeer(PeerId),
    RemovePeer(PeerId),

    GetLookupParams(PeerId, oneshot::Sender<(usize, usize, Vec<PeerId>)>),
    GetLocal(Key, oneshot::Sender<Option<Vec<u8>>>),
    /// Replies with the key evicted to make room, if any.
    PutRecord(DhtRecord, oneshot::Sender<PutOutcome>),
    Restore(Vec<DhtRecord>),
    Stats(oneshot::Sender<DhtStats>),

    HandleFindNode(PeerId, PeerId, oneshot::Sender<Vec<PeerId>>),
    HandleFindValue(PeerId, Key, oneshot::Sender<(Option<Vec<u8>>, Vec<PeerId>)>),

    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),
    /// Local records due for republish, and remote records that expired.
    TakeDue(u64, oneshot::Sender<(Vec<DhtRecord>, Vec<Key>)>),

    Quit,
}

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(
        id: PeerId,
        network: N,
        config: DhtConfig,
        store: Option<Arc<dyn RecordStore>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let network = Arc::new(network);
        let capacity = NonZeroUsize::new(config.max_records).unwrap_or(NonZeroUsize::MIN);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(id, config.k),
            records: LruCache::new(capacity),
            config: config.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id,
        };

        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            id,
            config,
            network,
            store,
        };

        node.spawn_periodic_bucket_refresh();
        node.spawn_periodic_republish();
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Load persisted records into the cache. Expired remote copies are
    /// discarded.
    pub async fn load_records(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let rows = store.get_all(DHT_PARTITION).await.map_err(NetworkError::from)?;
        let now = now_ms();
        let mut records = Vec::with_capacity(rows.len());
        for (id, bytes) in rows {
            match deserialize_bounded::<DhtRecord>(&bytes) {
                Ok(record) if !record.is_expired(now, self.config.record_ttl) => {
                    records.push(record)
                }
                Ok(_) => {
                    let _ = store.remove(DHT_PARTITION, &id).await;
                }
                Err(err) => {
                    return Err(NetworkError::from(StorageError::Corrupt(format!(
                        "dht record {id}: {err}"
                    )))
                    .into());
                }
            }
        }
        let count = records.len();
        self.cmd_tx
            .send(Command::Restore(records))
            .await
            .map_err(|_| anyhow!("dht actor closed"))?;
        debug!(count, "restored dht records");
        Ok(count)
    }

    /// Record a peer we exchanged messages with.
    pub async fn observe_peer(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::ObservePeer(peer)).await;
    }

    pub async fn remove_peer(&self, peer: &PeerId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(*peer)).await;
    }

    pub async fn stats(&self) -> DhtStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).await.is_err() {
            return DhtStats::default();
        }
        rx.await.unwrap_or_default()
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.bucket_refresh_interval);
            interval.tick().await;
            loop {
                interval.tick().await;

                let (tx, rx) = oneshot::channel();
                let threshold = node.config.bucket_refresh_interval;
                if node.cmd_tx.send(Command::GetStaleBuckets(threshold, tx)).await.is_err() {
                    break;
                }
                let stale_buckets = match rx.await {
                    Ok(buckets) => buckets,
                    Err(_) => break,
                };

                if stale_buckets.is_empty() {
                    continue;
                }

                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");

                for bucket_idx in stale_buckets {
                    let target = random_id_for_bucket(&node.id, bucket_idx);
                    if let Err(e) = node.find_node(target).await {
                        debug!(bucket = bucket_idx, error = ?e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
    }

    fn spawn_periodic_republish(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.maintenance_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if node.run_maintenance().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Republish due local records and drop expired remote ones. Returns the
    /// number of records republished.
    pub async fn run_maintenance(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::TakeDue(now_ms(), tx))
            .await
            .map_err(|_| anyhow!("dht actor closed"))?;
        let (due, expired) = rx.await.map_err(|_| anyhow!("dht actor closed"))?;

        if let Some(store) = &self.store {
            for key in &expired {
                if let Err(err) = store.remove(DHT_PARTITION, &hex::encode(key)).await {
                    warn!(key = hex::encode(&key[..8]), error = %err, "failed to drop expired record");
                }
            }
        }

        let republished = due.len();
        for record in due {
            if let Err(err) = self.persist(&record).await {
                warn!(key = hex::encode(&record.key_hash[..8]), error = %err, "failed to persist republished record");
            }
            let acks = self.replicate(record.key_hash, record.value).await?;
            trace!(key = hex::encode(&record.key_hash[..8]), acks, "republished record");
        }
        if republished > 0 || !expired.is_empty() {
            debug!(republished, expired = expired.len(), "dht maintenance");
        }
        Ok(republished)
    }

    // ------------------------------------------------------------------------
    // Inbound RPC handlers
    // ------------------------------------------------------------------------

    pub async fn handle_find_node(&self, from: &PeerId, target: PeerId) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HandleFindNode(*from, target, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn handle_find_value(&self, from: &PeerId, key: Key) -> (Option<Vec<u8>>, Vec<PeerId>) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HandleFindValue(*from, key, tx)).await.is_err() {
            return (None, Vec::new());
        }
        rx.await.unwrap_or((None, Vec::new()))
    }

    /// Keep a copy of a record pushed by `from`. Returns whether it was
    /// accepted.
    pub async fn handle_store(&self, from: &PeerId, key: Key, value: Vec<u8>) -> bool {
        self.observe_peer(*from).await;
        if value.len() > MAX_VALUE_SIZE {
            warn!(peer = %from, len = value.len(), "rejecting oversized dht value");
            return false;
        }
        let now = now_ms();
        let record = DhtRecord {
            key_hash: key,
            value,
            stored_at: now,
            next_republish_at: u64::MAX,
            origin: RecordOrigin::Remote,
        };
        match self.put_record(record).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(peer = %from, "remote copy refused, key is held locally");
                false
            }
            Err(err) => {
                warn!(peer = %from, error = %err, "failed to keep remote record");
                false
            }
        }
    }

    pub async fn handle_ping(&self, from: &PeerId) {
        self.observe_peer(*from).await;
    }

    /// Serve one inbound DHT request.
    pub async fn handle_request(&self, from: &PeerId, request: DhtRequest) -> DhtResponse {
        match request {
            DhtRequest::Ping => {
                self.handle_ping(from).await;
                DhtResponse::Ack
            }
            DhtRequest::FindNode { target } => DhtResponse::Nodes {
                peers: self.handle_find_node(from, target).await,
            },
            DhtRequest::FindValue { key } => match self.handle_find_value(from, key).await {
                (Some(value), _) => DhtResponse::Found { value },
                (None, closer) => DhtResponse::NotFound { closer },
            },
            DhtRequest::Store { key, value } => {
                if self.handle_store(from, key, value).await {
                    DhtResponse::Ack
                } else {
                    DhtResponse::Error {
                        message: "store rejected".into(),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub async fn find_node(&self, target: PeerId) -> Result<LookupResult> {
        let started = Instant::now();

        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLookupParams(target, tx)).await.is_err() {
            return Err(anyhow!("dht actor closed"));
        }
        let (k, alpha, mut shortlist) = rx.await.map_err(|_| anyhow!("dht actor closed"))?;

        let mut state = LookupState::Init;
        let mut seen: HashSet<PeerId> = shortlist.iter().copied().collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut rounds = 0;

        let mut best_distance = shortlist
            .first()
            .map(|p| p.xor_distance(&target))
            .unwrap_or([0xff; 32]);

        loop {
            if rounds >= MAX_LOOKUP_ROUNDS {
                warn!(target = %target, rounds, "iterative lookup exceeded max rounds");
                state = LookupState::Converged;
                break;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.lookup_timeout {
                debug!(
                    target = %target,
                    elapsed_ms = elapsed.as_millis(),
                    found = shortlist.len(),
                    "iterative lookup timeout, returning current results"
                );
                state = LookupState::TimedOut;
                break;
            }
            let remaining = self.config.lookup_timeout - elapsed;

            let candidates: Vec<PeerId> = shortlist
                .iter()
                .filter(|p| !queried.contains(*p) && **p != self.id)
                .take(alpha)
                .copied()
                .collect();

            if candidates.is_empty() {
                state = LookupState::Converged;
                break;
            }

            trace!(target = %target, ?state, rounds, "starting lookup round");
            state = LookupState::Querying;
            rounds += 1;
            queried.extend(candidates.iter().copied());

            // A query cut short by the overall deadline says nothing about the
            // peer, so only full-length timeouts count as failures.
            let per_query = self.config.query_timeout.min(remaining);
            let clipped = per_query < self.config.query_timeout;

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let net = self.network.clone();
                join_set.spawn(async move {
                    let result = tokio::time::timeout(per_query, net.find_node(&peer, target)).await;
                    (peer, result)
                });
            }

            let mut failed: Vec<PeerId> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((peer, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(Ok(peers)) => {
                        self.observe_peer(peer).await;
                        for p in peers {
                            if p != self.id && seen.insert(p) {
                                shortlist.push(p);
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        trace!(peer = %peer, error = %err, "find_node query failed");
                        failed.push(peer);
                    }
                    Err(_) if clipped => {
                        trace!(peer = %peer, "find_node query cut by lookup deadline");
                    }
                    Err(_) => {
                        trace!(peer = %peer, "find_node query timed out");
                        failed.push(peer);
                    }
                }
            }

            for peer in &failed {
                self.remove_peer(peer).await;
            }
            shortlist.retain(|p| !failed.contains(p));
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let any_closer = match shortlist.first() {
                Some(first) => {
                    let new_best = first.xor_distance(&target);
                    if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                        best_distance = new_best;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };

            if !any_closer {
                state = LookupState::Converged;
                break;
            }
        }

        debug!(
            target = %target,
            found = shortlist.len(),
            queried = queried.len(),
            rounds,
            ?state,
            "iterative lookup completed"
        );

        Ok(LookupResult {
            closest: shortlist,
            state,
            rounds,
            elapsed: started.elapsed(),
        })
    }

    async fn get_local(&self, key: &Key) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLocal(*key, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    async fn persist(&self, record: &DhtRecord) -> Result<(), StorageError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let bytes = serialize_record(record)
            .map_err(|err| StorageError::Corrupt(format!("unencodable dht record: {err}")))?;
        store.upsert(DHT_PARTITION, &hex::encode(record.key_hash), bytes).await
    }

    /// Hand a record to the actor and write through what it kept. Returns
    /// whether the record was accepted.
    async fn put_record(&self, record: DhtRecord) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PutRecord(record, tx))
            .await
            .map_err(|_| anyhow!("dht actor closed"))?;
        let PutOutcome { stored, evicted } = rx.await.map_err(|_| anyhow!("dht actor closed"))?;

        if let Some(stored) = &stored {
            self.persist(stored).await.map_err(NetworkError::from)?;
        }
        if let Some(key) = evicted
            && let Some(store) = &self.store
        {
            store
                .remove(DHT_PARTITION, &hex::encode(key))
                .await
                .map_err(NetworkError::from)?;
        }
        Ok(stored.is_some())
    }

    /// Push a value to the k closest peers; returns how many acknowledged.
    async fn replicate(&self, key_hash: Key, value: Vec<u8>) -> Result<usize> {
        let lookup = self.find_node(PeerId::from_bytes(key_hash)).await?;

        let mut join_set = JoinSet::new();
        for peer in lookup.closest.into_iter().take(self.config.k) {
            let net = self.network.clone();
            let value = value.clone();
            let timeout = self.config.query_timeout;
            join_set.spawn(async move {
                let result = tokio::time::timeout(timeout, net.store(&peer, key_hash, value)).await;
                (peer, matches!(result, Ok(Ok(()))))
            });
        }

        let mut acks = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, true)) => acks += 1,
                Ok((peer, false)) => self.remove_peer(&peer).await,
                Err(_) => {}
            }
        }
        Ok(acks)
    }

    /// Store `value` under `key`: locally first, then on the k closest peers.
    /// Returns the number of remote acknowledgments (0 when nobody is
    /// reachable; the local copy is kept regardless).
    pub async fn store(&self, key: &[u8], value: Vec<u8>) -> Result<usize> {
        if value.len() > MAX_VALUE_SIZE {
            bail!("value exceeds {MAX_VALUE_SIZE} bytes");
        }
        let key_hash = hash_key(key);
        let now = now_ms();
        let record = DhtRecord {
            key_hash,
            value: value.clone(),
            stored_at: now,
            next_republish_at: now + self.config.republish_interval.as_millis() as u64,
            origin: RecordOrigin::Local,
        };
        self.put_record(record).await?;

        let acks = self.replicate(key_hash, value).await?;
        debug!(key = hex::encode(&key_hash[..8]), acks, "stored value");
        Ok(acks)
    }

    /// Local copy first; otherwise ask the closest peers one at a time.
    pub async fn retrieve(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key_hash = hash_key(key);
        if let Some(value) = self.get_local(&key_hash).await {
            return Ok(Some(value));
        }

        let lookup = self.find_node(PeerId::from_bytes(key_hash)).await?;
        for peer in lookup.closest {
            let result =
                tokio::time::timeout(self.config.query_timeout, self.network.find_value(&peer, key_hash))
                    .await;
            match result {
                Ok(Ok((Some(value), _))) => {
                    let record = DhtRecord {
                        key_hash,
                        value: value.clone(),
                        stored_at: now_ms(),
                        next_republish_at: u64::MAX,
                        origin: RecordOrigin::Remote,
                    };
                    if let Err(err) = self.put_record(record).await {
                        warn!(error = %err, "failed to cache retrieved value");
                    }
                    return Ok(Some(value));
                }
                Ok(Ok((None, _))) => {}
                Ok(Err(_)) | Err(_) => self.remove_peer(&peer).await,
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------------
    // Room rosters
    // ------------------------------------------------------------------------

    /// Add ourselves to the roster of `room_id` and push it out. Holders
    /// merge it with the copies they already have.
    pub async fn announce_room(&self, room_id: &str) -> Result<usize> {
        let key = room_key(room_id);
        let mut roster = RoomRoster {
            room_id: room_id.to_string(),
            peers: Vec::new(),
        };
        if let Some(known) = self.retrieve(&key).await?.as_deref().and_then(RoomRoster::decode)
            && known.room_id == room_id
        {
            roster.peers = known.peers;
        }

        let now = now_ms();
        let mine = RoomRoster {
            room_id: room_id.to_string(),
            peers: vec![(self.id, now)],
        };
        roster.merge(mine, now, self.config.record_ttl.as_millis() as u64);
        self.store(&key, roster.encode()?).await
    }

    /// Peers recently announced in `room_id`, excluding ourselves.
    pub async fn lookup_room(&self, room_id: &str) -> Result<Vec<PeerId>> {
        let Some(bytes) = self.retrieve(&room_key(room_id)).await? else {
            return Ok(Vec::new());
        };
        let roster = RoomRoster::decode(&bytes).ok_or_else(|| anyhow!("room key holds a foreign value"))?;
        Ok(roster
            .peers
            .into_iter()
            .map(|(peer, _)| peer)
            .filter(|peer| *peer != self.id)
            .collect())
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<N: DhtRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObservePeer(peer) => {
                    self.handle_observe_peer(peer);
                }
                Command::RemovePeer(peer) => {
                    if self.routing.remove(&peer) {
                        debug!(peer = %peer, "removed unresponsive peer from routing table");
                    }
                }
                Command::GetLookupParams(target, reply) => {
                    let closest = self.routing.closest(&target, self.config.k);
                    let _ = reply.send((self.config.k, self.config.alpha, closest));
                }
                Command::GetLocal(key, reply) => {
                    let value = self.records.get(&key).map(|r| r.value.clone());
                    let _ = reply.send(value);
                }
                Command::PutRecord(record, reply) => {
                    let _ = reply.send(self.put_record(record));
                }
                Command::Restore(records) => {
                    for record in records {
                        let _ = self.put_record(record);
                    }
                }
                Command::Stats(reply) => {
                    let _ = reply.send(DhtStats {
                        routing_table_size: self.routing.len(),
                        records: self.records.len(),
                    });
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.handle_observe_peer(from);
                    let closest = self.routing.closest(&target, self.config.k);
                    let _ = reply.send(closest);
                }
                Command::HandleFindValue(from, key, reply) => {
                    self.handle_observe_peer(from);
                    if let Some(record) = self.records.get(&key) {
                        let _ = reply.send((Some(record.value.clone()), Vec::new()));
                    } else {
                        let target = PeerId::from_bytes(key);
                        let closest = self.routing.closest(&target, self.config.k);
                        let _ = reply.send((None, closest));
                    }
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::ApplyPingResult(pending, alive) => {
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::TakeDue(now, reply) => {
                    let _ = reply.send(self.take_due(now));
                }
                Command::Quit => {
                    break;
                }
            }
        }
    }

    fn handle_observe_peer(&mut self, peer: PeerId) {
        if peer == self.id {
            return;
        }
        if let Some(update) = self.routing.update_with_pending(peer) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            let timeout = self.config.query_timeout;
            tokio::spawn(async move {
                let alive = matches!(
                    tokio::time::timeout(timeout, network.ping(&update.oldest)).await,
                    Ok(Ok(()))
                );
                let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
            });
        }
    }

    /// Rosters merge with the copy already held. Any other local record is
    /// never displaced by a remote copy of the same key.
    fn put_record(&mut self, mut record: DhtRecord) -> PutOutcome {
        let key = record.key_hash;
        if let Some(existing) = self.records.peek(&key) {
            let ttl_ms = self.config.record_ttl.as_millis() as u64;
            let keeps_local = existing.origin == RecordOrigin::Local && record.origin == RecordOrigin::Remote;
            match merge_roster_values(&existing.value, &record.value, now_ms(), ttl_ms) {
                Some(value) => {
                    record.value = value;
                    if keeps_local {
                        record.origin = RecordOrigin::Local;
                        record.next_republish_at = existing.next_republish_at;
                    }
                }
                None if keeps_local => return PutOutcome::default(),
                None => {}
            }
        }
        let stored = record.clone();
        let evicted = match self.records.push(key, record) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        };
        PutOutcome {
            stored: Some(stored),
            evicted,
        }
    }

    fn take_due(&mut self, now: u64) -> (Vec<DhtRecord>, Vec<Key>) {
        let republish_ms = self.config.republish_interval.as_millis() as u64;
        let mut due = Vec::new();
        let mut expired = Vec::new();

        for (key, record) in self.records.iter_mut() {
            if record.is_expired(now, self.config.record_ttl) {
                expired.push(*key);
            } else if record.origin == RecordOrigin::Local && record.next_republish_at <= now {
                record.next_republish_at = now + republish_ms;
                due.push(record.clone());
            }
        }
        for key in &expired {
            self.records.pop(key);
        }
        (due, expired)
    }
}
