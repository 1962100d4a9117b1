//! # Identity
//!
//! This module defines the identity types used throughout the mesh:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PublicKey`]: 32-byte Ed25519 verifying key, shipped alongside signed data
//! - [`PeerId`]: 256-bit identifier derived from the public key, the DHT key
//!   space and the address used by every other component
//! - [`PeerIdentity`]: the local node's persisted identity
//!
//! ## Identity Model
//!
//! `PeerId = BLAKE3("seymour-peer-id-v1:" || public_key)`. Anyone holding the
//! public key can check the binding, so a peer id is self-certifying: a
//! signature verified against a key whose derived id matches the claimed sender
//! proves the sender.
//!
//! Identities are generated once from OS randomness and persisted in the
//! `identity` partition of the record store. They never change afterwards.
//!
//! ## Invariants
//!
//! - `PeerId::from_bytes(b).as_bytes() == b`
//! - XOR distance is symmetric and zero only against itself
//! - Only valid Ed25519 points are accepted as public keys

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::crypto::{self, hex32};
use crate::error::NetworkError;
use crate::messages::{deserialize_bounded, serialize_record};
use crate::storage::{IDENTITY_PARTITION, RecordStore, StorageError};

/// Domain prefix for deriving a peer id from a public key.
const PEER_ID_DOMAIN: &[u8] = b"seymour-peer-id-v1:";

/// Row id of the local identity inside the identity partition.
const SELF_RECORD_ID: &str = "self";

#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Like [`Keypair::generate`], but reports an unavailable random source
    /// instead of panicking.
    pub fn try_generate() -> Result<Self, NetworkError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|err| NetworkError::KeyGeneration(err.to_string()))?;
        Ok(Self::from_secret_key_bytes(&seed))
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public_key().peer_id()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(#[serde(with = "hex32")] [u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn peer_id(&self) -> PeerId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PEER_ID_DOMAIN);
        hasher.update(&self.0);
        PeerId(*hasher.finalize().as_bytes())
    }

    /// Rejects trivially invalid keys and anything that is not an Ed25519
    /// point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &hex::encode(self.0)[..16])
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(#[serde(with = "hex32")] [u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Compare two XOR distances as big-endian integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

/// Short form for logs; use [`PeerId::to_hex`] for the full id.
impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    secret_key: [u8; 32],
    created_at: u64,
}

/// The local node's identity. The keypair never leaves the process.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub public_key: PublicKey,
    keypair: Keypair,
}

impl PeerIdentity {
    pub fn generate() -> Result<Self, NetworkError> {
        Ok(Self::from_keypair(Keypair::try_generate()?))
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        Self {
            id: keypair.peer_id(),
            public_key: keypair.public_key(),
            keypair,
        }
    }

    /// Load the persisted identity, generating and persisting one on first
    /// run.
    pub async fn generate_or_load(store: &dyn RecordStore) -> Result<Self> {
        let existing = store
            .get(IDENTITY_PARTITION, SELF_RECORD_ID)
            .await
            .map_err(NetworkError::from)?;

        if let Some(bytes) = existing {
            let record: IdentityRecord = deserialize_bounded(&bytes).map_err(|err| {
                NetworkError::from(StorageError::Corrupt(format!("identity record: {err}")))
            })?;
            let identity = Self::from_keypair(Keypair::from_secret_key_bytes(&record.secret_key));
            info!(peer = %identity.id, "loaded persisted identity");
            return Ok(identity);
        }

        let identity = Self::generate()?;
        let record = IdentityRecord {
            secret_key: identity.keypair.secret_key_bytes(),
            created_at: now_ms(),
        };
        let bytes = serialize_record(&record).context("failed to encode identity record")?;
        store
            .upsert(IDENTITY_PARTITION, SELF_RECORD_ID, bytes)
            .await
            .map_err(NetworkError::from)?;
        info!(peer = %identity.id, "generated new identity");
        Ok(identity)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Sign the canonical form of `payload` under `domain`.
    pub fn sign<T: Serialize + ?Sized>(&self, domain: &[u8], payload: &T) -> Result<Vec<u8>> {
        crypto::sign_canonical(&self.keypair, domain, payload)
            .context("payload has no canonical form")
    }

    /// Never fails loudly: any malformed input is simply not a valid
    /// signature.
    pub fn verify<T: Serialize + ?Sized>(
        domain: &[u8],
        payload: &T,
        signature: &[u8],
        public_key: &PublicKey,
    ) -> bool {
        crypto::verify_canonical(public_key, domain, payload, signature).is_ok()
    }
}
