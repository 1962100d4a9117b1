//! Typed failures surfaced through `anyhow::Error`.
//!
//! Public operations return `anyhow::Result`; when the failure belongs to the
//! taxonomy below the error carries a [`NetworkError`] that callers can recover
//! with `downcast_ref::<NetworkError>()`.

use crate::identity::PeerId;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum NetworkError {
    /// The OS random source could not provide key material.
    KeyGeneration(String),
    /// Every configured signaling server failed (or stopped answering).
    SignalingConnection { attempts: usize, last_error: String },
    /// A peer could not be reached after all reconnect attempts.
    PeerConnectionFailure { peer: PeerId, attempts: u32 },
    /// A lookup exhausted its time budget before converging.
    LookupTimeout { elapsed_ms: u64 },
    /// A signature, content hash or sender binding did not check out.
    VerificationFailure(String),
    Storage(StorageError),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::KeyGeneration(reason) => {
                write!(f, "key generation failed: {reason}")
            }
            NetworkError::SignalingConnection { attempts, last_error } => {
                write!(
                    f,
                    "signaling unavailable after {attempts} attempts: {last_error}"
                )
            }
            NetworkError::PeerConnectionFailure { peer, attempts } => {
                write!(f, "peer {peer} unreachable after {attempts} attempts")
            }
            NetworkError::LookupTimeout { elapsed_ms } => {
                write!(f, "lookup timed out after {elapsed_ms}ms")
            }
            NetworkError::VerificationFailure(reason) => {
                write!(f, "verification failed: {reason}")
            }
            NetworkError::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for NetworkError {
    fn from(err: StorageError) -> Self {
        NetworkError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_survive_anyhow_wrapping() {
        let err: anyhow::Error = NetworkError::SignalingConnection {
            attempts: 2,
            last_error: "refused".into(),
        }
        .into();
        let err = err.context("joining room");

        match err.downcast_ref::<NetworkError>() {
            Some(NetworkError::SignalingConnection { attempts, .. }) => assert_eq!(*attempts, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn storage_error_is_exposed_as_source() {
        let err = NetworkError::from(StorageError::Corrupt("bad record".into()));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("bad record"));
    }
}
