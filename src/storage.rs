//! # Persistence Boundary
//!
//! The core only needs a partitioned key-value store: read one record, read a
//! whole partition, upsert by id, remove. [`RecordStore`] is that contract;
//! [`MemoryStore`] backs tests and ephemeral nodes, [`FileStore`] keeps one file
//! per record under a data directory.
//!
//! [`CommentStore`] layers the typed comment model on top:
//!
//! | Partition | Id | Value |
//! |-----------|----|-------|
//! | `comments:<room_id>` | comment id (hex) | bincode [`Comment`] |
//! | `comment-index` | comment id (hex) | room id (UTF-8) |
//! | `sync` | peer id (hex) | last sync, ms since epoch (u64 LE) |
//!
//! Every read-modify-write of a comment goes through one async mutex so that
//! concurrent merges of the same comment can never lose a vote.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::comment::{Comment, CommentId, MergeOutcome};
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::messages::{deserialize_bounded, serialize_record};

pub const COMMENT_INDEX_PARTITION: &str = "comment-index";
pub const SYNC_PARTITION: &str = "sync";
pub const IDENTITY_PARTITION: &str = "identity";
pub const DHT_PARTITION: &str = "dht";

/// A bounded slice of a room, see [`CommentStore::comments_page`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    /// Newer comments remain past the last one in `comments`.
    pub more: bool,
}

pub fn comments_partition(room_id: &str) -> String {
    format!("comments:{room_id}")
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    /// A stored record could not be decoded.
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "i/o failure: {err}"),
            StorageError::Corrupt(reason) => write!(f, "corrupt record: {reason}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            StorageError::Corrupt(_) => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

// ============================================================================
// Record Store Contract
// ============================================================================

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn get(&self, partition: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Every record of a partition, ordered by id.
    async fn get_all(&self, partition: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    async fn upsert(&self, partition: &str, id: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Returns whether a record was present.
    async fn remove(&self, partition: &str, id: &str) -> Result<bool, StorageError>;
}

#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, partition: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(partition).and_then(|p| p.get(id)).cloned())
    }

    async fn get_all(&self, partition: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .map(|p| p.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, partition: &str, id: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(partition.to_string())
            .or_default()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn remove(&self, partition: &str, id: &str) -> Result<bool, StorageError> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions
            .get_mut(partition)
            .map(|p| p.remove(id).is_some())
            .unwrap_or(false))
    }
}

/// One directory per partition and one file per record. Directory names are
/// the BLAKE3 hash of the partition (room URLs can be arbitrarily long), file
/// names are the hex-encoded record id.
pub struct FileStore {
    root: PathBuf,
}

const TEMP_SUFFIX: &str = ".tmp";

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn partition_dir(&self, partition: &str) -> PathBuf {
        self.root.join(blake3::hash(partition.as_bytes()).to_hex().as_str())
    }

    fn record_path(&self, partition: &str, id: &str) -> PathBuf {
        self.partition_dir(partition).join(hex::encode(id.as_bytes()))
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn get(&self, partition: &str, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.record_path(partition, id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_all(&self, partition: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let dir = self.partition_dir(partition);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let Some(id) = hex::decode(name).ok().and_then(|raw| String::from_utf8(raw).ok())
            else {
                trace!(file = name, "skipping foreign file in partition directory");
                continue;
            };
            let bytes = tokio::fs::read(entry.path()).await?;
            records.push((id, bytes));
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    async fn upsert(&self, partition: &str, id: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let dir = self.partition_dir(partition);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.record_path(partition, id);
        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, &value).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn remove(&self, partition: &str, id: &str) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(self.record_path(partition, id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

// ============================================================================
// Typed comment storage
// ============================================================================

#[derive(Clone)]
pub struct CommentStore {
    store: Arc<dyn RecordStore>,
    merge_lock: Arc<Mutex<()>>,
}

impl CommentStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            merge_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Merge `incoming` with whatever is stored under its id and persist the
    /// result if it changed anything. Returns the merged comment alongside
    /// what happened.
    pub async fn upsert(&self, incoming: Comment) -> Result<(Comment, MergeOutcome)> {
        let _guard = self.merge_lock.lock().await;

        let partition = comments_partition(&incoming.room_id);
        let id = incoming.id.to_hex();
        let existing = self
            .store
            .get(&partition, &id)
            .await
            .map_err(NetworkError::from)?
            .map(|bytes| decode_comment(&bytes))
            .transpose()?;

        let (merged, outcome) = match existing {
            None => (incoming, MergeOutcome::Inserted),
            Some(mut current) => {
                let changed = current.merge(&incoming);
                let outcome = if changed {
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Unchanged
                };
                (current, outcome)
            }
        };

        if outcome != MergeOutcome::Unchanged {
            let bytes = serialize_record(&merged).context("failed to encode comment")?;
            self.store
                .upsert(&partition, &id, bytes)
                .await
                .map_err(NetworkError::from)?;
            if outcome == MergeOutcome::Inserted {
                self.store
                    .upsert(COMMENT_INDEX_PARTITION, &id, merged.room_id.clone().into_bytes())
                    .await
                    .map_err(NetworkError::from)?;
            }
            debug!(comment = %merged.id, room = %merged.room_id, ?outcome, "comment stored");
        }

        Ok((merged, outcome))
    }

    pub async fn get(&self, id: &CommentId) -> Result<Option<Comment>> {
        let key = id.to_hex();
        let Some(room) = self
            .store
            .get(COMMENT_INDEX_PARTITION, &key)
            .await
            .map_err(NetworkError::from)?
        else {
            return Ok(None);
        };
        let room = String::from_utf8(room)
            .map_err(|_| NetworkError::from(StorageError::Corrupt(format!("room index for {key}"))))?;
        self.store
            .get(&comments_partition(&room), &key)
            .await
            .map_err(NetworkError::from)?
            .map(|bytes| decode_comment(&bytes))
            .transpose()
    }

    /// All comments of a room, oldest first.
    pub async fn room_comments(&self, room_id: &str) -> Result<Vec<Comment>> {
        let records = self
            .store
            .get_all(&comments_partition(room_id))
            .await
            .map_err(NetworkError::from)?;
        let mut comments = records
            .iter()
            .map(|(_, bytes)| decode_comment(bytes))
            .collect::<Result<Vec<_>>>()?;
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(comments)
    }

    /// One page of the comments created strictly after `since`, oldest first.
    ///
    /// A page holds at most `max_count` comments and roughly `max_bytes` of
    /// encoded comments, and never splits a run of equal `created_at` values,
    /// so the last timestamp of a page is a valid `since` for the next one.
    /// A single run larger than the bounds is returned whole.
    pub async fn comments_page(
        &self,
        room_id: &str,
        since: u64,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<CommentPage> {
        let mut comments = self.room_comments(room_id).await?;
        comments.retain(|c| c.created_at > since);

        let mut cut = comments.len();
        let mut bytes = 0;
        for (i, comment) in comments.iter().enumerate() {
            bytes += serde_json::to_vec(comment).map(|v| v.len()).unwrap_or(0);
            if i >= max_count.max(1) || (i > 0 && bytes > max_bytes) {
                cut = i;
                break;
            }
        }
        if cut == comments.len() {
            return Ok(CommentPage { comments, more: false });
        }

        let boundary = comments[cut].created_at;
        let mut end = cut;
        while end > 0 && comments[end - 1].created_at == boundary {
            end -= 1;
        }
        if end == 0 {
            end = comments.iter().take_while(|c| c.created_at == boundary).count();
        }
        let more = end < comments.len();
        comments.truncate(end);
        Ok(CommentPage { comments, more })
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self
            .store
            .get_all(COMMENT_INDEX_PARTITION)
            .await
            .map_err(NetworkError::from)?
            .len())
    }

    pub async fn last_sync(&self, peer: &PeerId) -> Result<u64> {
        let Some(bytes) = self
            .store
            .get(SYNC_PARTITION, &peer.to_hex())
            .await
            .map_err(NetworkError::from)?
        else {
            return Ok(0);
        };
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetworkError::from(StorageError::Corrupt(format!("sync cursor for {peer}"))))?;
        Ok(u64::from_le_bytes(raw))
    }

    pub async fn set_last_sync(&self, peer: &PeerId, at_ms: u64) -> Result<()> {
        self.store
            .upsert(SYNC_PARTITION, &peer.to_hex(), at_ms.to_le_bytes().to_vec())
            .await
            .map_err(NetworkError::from)?;
        Ok(())
    }
}

fn decode_comment(bytes: &[u8]) -> Result<Comment> {
    deserialize_bounded::<Comment>(bytes).map_err(|err| {
        NetworkError::from(StorageError::Corrupt(format!("comment record: {err}"))).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::CommentDraft;
    use crate::identity::Keypair;

    fn draft(room: &str, text: &str) -> CommentDraft {
        CommentDraft {
            room_id: room.to_string(),
            text: text.to_string(),
            display_name: None,
            selected_quote: None,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn memory_store_partitions_are_isolated() {
        let store = MemoryStore::new();
        store.upsert("a", "1", vec![1]).await.unwrap();
        store.upsert("b", "1", vec![2]).await.unwrap();

        assert_eq!(store.get("a", "1").await.unwrap(), Some(vec![1]));
        assert_eq!(store.get_all("b").await.unwrap(), vec![("1".to_string(), vec![2])]);
        assert!(store.remove("a", "1").await.unwrap());
        assert!(!store.remove("a", "1").await.unwrap());
        assert!(store.get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.upsert("comments:https://example.com/page", "id-1", vec![7, 8]).await.unwrap();
            store.upsert("comments:https://example.com/page", "id-1", vec![9]).await.unwrap();
            store.upsert("sync", "peer", vec![1]).await.unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get("comments:https://example.com/page", "id-1").await.unwrap(),
            Some(vec![9])
        );
        assert_eq!(store.get_all("sync").await.unwrap().len(), 1);
        assert!(store.remove("sync", "peer").await.unwrap());
        assert_eq!(store.get("sync", "peer").await.unwrap(), None);
    }

    #[tokio::test]
    async fn comment_upsert_is_idempotent() {
        let store = CommentStore::new(Arc::new(MemoryStore::new()));
        let author = Keypair::generate();
        let comment = Comment::create(&author, draft("https://example.com/a", "hi")).unwrap();

        let (_, first) = store.upsert(comment.clone()).await.unwrap();
        let (_, second) = store.upsert(comment.clone()).await.unwrap();

        assert_eq!(first, MergeOutcome::Inserted);
        assert_eq!(second, MergeOutcome::Unchanged);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(&comment.id).await.unwrap(), Some(comment));
    }

    #[tokio::test]
    async fn upsert_merges_votes_from_both_sides() {
        let store = CommentStore::new(Arc::new(MemoryStore::new()));
        let author = Keypair::generate();
        let voter_a = Keypair::generate();
        let voter_b = Keypair::generate();
        let comment = Comment::create(&author, draft("https://example.com/a", "hi")).unwrap();

        let mut left = comment.clone();
        left.votes.push(comment.vote(&voter_a).unwrap());
        let mut right = comment.clone();
        right.votes.push(comment.vote(&voter_b).unwrap());

        store.upsert(left).await.unwrap();
        let (merged, outcome) = store.upsert(right).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Updated);
        assert_eq!(merged.upvotes(), 2);
    }

    #[tokio::test]
    async fn pages_filter_bound_and_continue() {
        let store = CommentStore::new(Arc::new(MemoryStore::new()));
        let author = Keypair::generate();
        let room = "https://example.com/a";
        for i in 0..5 {
            let c = Comment::create_at(&author, draft(room, &format!("c{i}")), 1_000 + i).unwrap();
            store.upsert(c).await.unwrap();
        }

        let newer = store.comments_page(room, 1_001, 10, usize::MAX).await.unwrap();
        assert_eq!(newer.comments.len(), 3);
        assert!(!newer.more);
        assert!(newer.comments.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let first = store.comments_page(room, 0, 2, usize::MAX).await.unwrap();
        assert_eq!(first.comments.len(), 2);
        assert!(first.more);
        let since = first.comments.last().unwrap().created_at;
        let second = store.comments_page(room, since, 2, usize::MAX).await.unwrap();
        let third = store
            .comments_page(room, second.comments.last().unwrap().created_at, 2, usize::MAX)
            .await
            .unwrap();
        assert_eq!(second.comments.len() + third.comments.len(), 3);
        assert!(second.more && !third.more);

        let empty = store.comments_page("https://other.example/", 0, 10, usize::MAX).await.unwrap();
        assert!(empty.comments.is_empty() && !empty.more);
    }

    #[tokio::test]
    async fn pages_keep_equal_timestamps_together_and_respect_bytes() {
        let store = CommentStore::new(Arc::new(MemoryStore::new()));
        let author = Keypair::generate();
        let room = "https://example.com/a";
        for (i, at) in [1_000, 2_000, 2_000, 2_000, 3_000].into_iter().enumerate() {
            let c = Comment::create_at(&author, draft(room, &format!("c{i}")), at).unwrap();
            store.upsert(c).await.unwrap();
        }

        // The cut would fall inside the 2_000 run, so the page ends before it.
        let page = store.comments_page(room, 0, 2, usize::MAX).await.unwrap();
        assert_eq!(page.comments.len(), 1);
        assert!(page.more);

        // A run longer than the limit is returned whole.
        let page = store.comments_page(room, 1_000, 2, usize::MAX).await.unwrap();
        assert_eq!(page.comments.len(), 3);
        assert!(page.comments.iter().all(|c| c.created_at == 2_000));
        assert!(page.more);

        // A byte bound smaller than one comment still makes progress.
        let page = store.comments_page(room, 2_000, 10, 1).await.unwrap();
        assert_eq!(page.comments.len(), 1);
        assert!(!page.more);
    }

    #[tokio::test]
    async fn sync_cursor_defaults_to_zero() {
        let store = CommentStore::new(Arc::new(MemoryStore::new()));
        let peer = Keypair::generate().peer_id();
        assert_eq!(store.last_sync(&peer).await.unwrap(), 0);
        store.set_last_sync(&peer, 42).await.unwrap();
        assert_eq!(store.last_sync(&peer).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn corrupt_record_is_a_storage_error() {
        let records = Arc::new(MemoryStore::new());
        let store = CommentStore::new(records.clone());
        records
            .upsert(&comments_partition("r"), "bad", vec![0xff; 3])
            .await
            .unwrap();

        let err = store.room_comments("r").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetworkError>(),
            Some(NetworkError::Storage(StorageError::Corrupt(_)))
        ));
    }
}
