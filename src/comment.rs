//! # Comment Model
//!
//! A [`Comment`] has an immutable, author-signed content part and two mutable
//! parts that converge under [`Comment::merge`]:
//!
//! - `votes`: at most one signed [`Vote`] per voter
//! - `deletion`: an author-signed [`Deletion`] tombstone
//!
//! The comment id is the content hash of the immutable part, which includes a
//! random nonce so two identical texts posted in the same millisecond still get
//! distinct ids. Anyone can verify a comment without knowing its author in
//! advance: the author's public key travels with the comment and the author id
//! is derived from it.
//!
//! Merge is commutative, associative and idempotent: votes are a set keyed by
//! voter (ties resolved by the smallest `(created_at, signature)`), deletions
//! are sticky (earliest wins), and `votes` is kept sorted by voter so equal
//! states compare equal.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::crypto::{
    self, COMMENT_SIGNATURE_DOMAIN, DELETION_SIGNATURE_DOMAIN, VOTE_SIGNATURE_DOMAIN, hex_bytes,
    hex32,
};
use crate::error::NetworkError;
use crate::identity::{Keypair, PeerId, PublicKey, now_ms};

/// Longest comment text accepted for posting.
pub const MAX_COMMENT_CHARS: usize = 10_000;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(#[serde(with = "hex32")] [u8; 32]);

impl CommentId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommentId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Canonical room key for a page URL: origin plus path, no trailing slash.
/// Query strings and fragments do not split a page into several rooms.
/// Input that does not parse as an absolute URL is only trimmed.
pub fn normalize_room_id(url: &str) -> String {
    let trimmed = url.trim();
    match url::Url::parse(trimmed) {
        Ok(parsed) if parsed.has_host() => {
            let origin = parsed.origin().ascii_serialization();
            let path = parsed.path().trim_end_matches('/');
            format!("{origin}{path}")
        }
        _ => trimmed.trim_end_matches('/').to_string(),
    }
}

/// What the local user typed, before signing.
#[derive(Clone, Debug, Default)]
pub struct CommentDraft {
    pub room_id: String,
    pub text: String,
    pub display_name: Option<String>,
    pub selected_quote: Option<String>,
    pub reply_to: Option<CommentId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub comment_id: CommentId,
    pub room_id: String,
    pub voter: PeerId,
    pub voter_key: PublicKey,
    pub created_at: u64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoteBody<'a> {
    comment_id: &'a CommentId,
    room_id: &'a str,
    voter: &'a PeerId,
    voter_key: &'a PublicKey,
    created_at: u64,
}

impl Vote {
    fn body(&self) -> VoteBody<'_> {
        VoteBody {
            comment_id: &self.comment_id,
            room_id: &self.room_id,
            voter: &self.voter,
            voter_key: &self.voter_key,
            created_at: self.created_at,
        }
    }

    pub fn create(keypair: &Keypair, comment_id: CommentId, room_id: &str) -> Result<Self> {
        let mut vote = Vote {
            comment_id,
            room_id: room_id.to_string(),
            voter: keypair.peer_id(),
            voter_key: keypair.public_key(),
            created_at: now_ms(),
            signature: Vec::new(),
        };
        vote.signature = crypto::sign_canonical(keypair, VOTE_SIGNATURE_DOMAIN, &vote.body())
            .context("vote has no canonical form")?;
        Ok(vote)
    }

    pub fn verify(&self) -> bool {
        self.voter_key.peer_id() == self.voter
            && crypto::verify_canonical(
                &self.voter_key,
                VOTE_SIGNATURE_DOMAIN,
                &self.body(),
                &self.signature,
            )
            .is_ok()
    }

    fn precedes(&self, other: &Vote) -> bool {
        (self.created_at, &self.signature) < (other.created_at, &other.signature)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deletion {
    pub comment_id: CommentId,
    pub room_id: String,
    pub author: PeerId,
    pub author_key: PublicKey,
    pub created_at: u64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeletionBody<'a> {
    comment_id: &'a CommentId,
    room_id: &'a str,
    author: &'a PeerId,
    author_key: &'a PublicKey,
    created_at: u64,
}

impl Deletion {
    fn body(&self) -> DeletionBody<'_> {
        DeletionBody {
            comment_id: &self.comment_id,
            room_id: &self.room_id,
            author: &self.author,
            author_key: &self.author_key,
            created_at: self.created_at,
        }
    }

    /// Only checks that the signer is who the tombstone claims. Whether that
    /// signer wrote the comment is checked when the tombstone is applied.
    pub fn verify(&self) -> bool {
        self.author_key.peer_id() == self.author
            && crypto::verify_canonical(
                &self.author_key,
                DELETION_SIGNATURE_DOMAIN,
                &self.body(),
                &self.signature,
            )
            .is_ok()
    }

    fn precedes(&self, other: &Deletion) -> bool {
        (self.created_at, &self.signature) < (other.created_at, &other.signature)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub room_id: String,
    pub author: PeerId,
    pub author_key: PublicKey,
    pub display_name: Option<String>,
    pub text: String,
    pub selected_quote: Option<String>,
    pub reply_to: Option<CommentId>,
    pub created_at: u64,
    pub nonce: u64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub votes: Vec<Vote>,
    pub deletion: Option<Deletion>,
}

/// The immutable, signed part of a comment.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommentContent<'a> {
    room_id: &'a str,
    author: &'a PeerId,
    author_key: &'a PublicKey,
    display_name: Option<&'a str>,
    text: &'a str,
    selected_quote: Option<&'a str>,
    reply_to: Option<&'a CommentId>,
    created_at: u64,
    nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl Comment {
    pub fn create(keypair: &Keypair, draft: CommentDraft) -> Result<Self> {
        Self::create_at(keypair, draft, now_ms())
    }

    pub fn create_at(keypair: &Keypair, draft: CommentDraft, created_at: u64) -> Result<Self> {
        if draft.text.trim().is_empty() {
            bail!("comment text is empty");
        }
        if draft.text.chars().count() > MAX_COMMENT_CHARS {
            bail!("comment text exceeds {MAX_COMMENT_CHARS} characters");
        }

        let mut comment = Comment {
            id: CommentId([0u8; 32]),
            room_id: draft.room_id,
            author: keypair.peer_id(),
            author_key: keypair.public_key(),
            display_name: draft.display_name,
            text: draft.text,
            selected_quote: draft.selected_quote,
            reply_to: draft.reply_to,
            created_at,
            nonce: rand::random(),
            signature: Vec::new(),
            votes: Vec::new(),
            deletion: None,
        };
        comment.id = comment.compute_id()?;
        comment.signature =
            crypto::sign_canonical(keypair, COMMENT_SIGNATURE_DOMAIN, &comment.content())
                .context("comment has no canonical form")?;
        Ok(comment)
    }

    fn content(&self) -> CommentContent<'_> {
        CommentContent {
            room_id: &self.room_id,
            author: &self.author,
            author_key: &self.author_key,
            display_name: self.display_name.as_deref(),
            text: &self.text,
            selected_quote: self.selected_quote.as_deref(),
            reply_to: self.reply_to.as_ref(),
            created_at: self.created_at,
            nonce: self.nonce,
        }
    }

    pub fn compute_id(&self) -> Result<CommentId> {
        let hash = crypto::content_hash(&self.content(), &[])
            .context("comment has no canonical form")?;
        Ok(CommentId(hash))
    }

    /// Full integrity check: author binding, content id, author signature and
    /// every attached vote and tombstone.
    pub fn verify(&self) -> Result<(), NetworkError> {
        let fail = |reason: &str| Err(NetworkError::VerificationFailure(format!("comment {}: {reason}", self.id)));

        if self.author_key.peer_id() != self.author {
            return fail("author id does not match author key");
        }
        match self.compute_id() {
            Ok(id) if id == self.id => {}
            _ => return fail("content hash mismatch"),
        }
        if crypto::verify_canonical(
            &self.author_key,
            COMMENT_SIGNATURE_DOMAIN,
            &self.content(),
            &self.signature,
        )
        .is_err()
        {
            return fail("bad author signature");
        }
        if !self.votes.iter().all(|v| self.accepts_vote(v) && v.verify()) {
            return fail("invalid vote");
        }
        if let Some(deletion) = &self.deletion
            && !(self.accepts_deletion(deletion) && deletion.verify())
        {
            return fail("invalid deletion");
        }
        Ok(())
    }

    pub fn vote(&self, keypair: &Keypair) -> Result<Vote> {
        Vote::create(keypair, self.id, &self.room_id)
    }

    pub fn delete(&self, keypair: &Keypair) -> Result<Deletion> {
        if keypair.peer_id() != self.author {
            return Err(NetworkError::VerificationFailure(
                "only the author may delete a comment".into(),
            )
            .into());
        }
        let mut deletion = Deletion {
            comment_id: self.id,
            room_id: self.room_id.clone(),
            author: self.author,
            author_key: self.author_key,
            created_at: now_ms(),
            signature: Vec::new(),
        };
        deletion.signature =
            crypto::sign_canonical(keypair, DELETION_SIGNATURE_DOMAIN, &deletion.body())
                .context("deletion has no canonical form")?;
        Ok(deletion)
    }

    pub fn upvotes(&self) -> usize {
        self.votes.len()
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion.is_some()
    }

    fn accepts_vote(&self, vote: &Vote) -> bool {
        vote.comment_id == self.id && vote.room_id == self.room_id
    }

    fn accepts_deletion(&self, deletion: &Deletion) -> bool {
        deletion.comment_id == self.id
            && deletion.room_id == self.room_id
            && deletion.author == self.author
            && deletion.author_key == self.author_key
    }

    /// Add a (verified) vote. Returns whether the state changed.
    pub fn apply_vote(&mut self, vote: Vote) -> bool {
        if !self.accepts_vote(&vote) {
            return false;
        }
        match self.votes.iter_mut().find(|v| v.voter == vote.voter) {
            Some(existing) => {
                if vote.precedes(existing) {
                    *existing = vote;
                    true
                } else {
                    false
                }
            }
            None => {
                self.votes.push(vote);
                self.votes.sort_by(|a, b| a.voter.cmp(&b.voter));
                true
            }
        }
    }

    /// Attach a (verified) tombstone if it was signed with this comment's
    /// author key. Returns whether the state changed.
    pub fn apply_deletion(&mut self, deletion: Deletion) -> bool {
        if !self.accepts_deletion(&deletion) {
            return false;
        }
        let replace = match &self.deletion {
            Some(existing) => deletion.precedes(existing),
            None => true,
        };
        if replace {
            self.deletion = Some(deletion);
        }
        replace
    }

    /// Fold the mutable state of another replica of the same comment into
    /// this one. Returns whether anything changed.
    pub fn merge(&mut self, other: &Comment) -> bool {
        if other.id != self.id {
            return false;
        }
        let mut changed = false;
        for vote in &other.votes {
            changed |= self.apply_vote(vote.clone());
        }
        if let Some(deletion) = &other.deletion {
            changed |= self.apply_deletion(deletion.clone());
        }
        changed
    }
}
