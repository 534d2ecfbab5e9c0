//! Error types for persona reservation.

use chorus_types::{PersonaId, SessionId};
use std::path::PathBuf;

/// Errors raised by a [`RegistryStore`](crate::store::RegistryStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing files failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The atomic rename of a temp file into place failed.
    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },

    /// A compare-and-swap found a different revision than expected.
    #[error("revision mismatch on {key}: expected {expected:?}, found {actual:?}")]
    RevisionMismatch {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// The lock guarding a key could not be acquired in time.
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    /// Too many concurrent writers kept invalidating the read revision.
    #[error("gave up on {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: usize },

    /// The key cannot be mapped to a storage location.
    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

/// Errors returned by [`PersonaRegistry`](crate::registry::PersonaRegistry).
#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    /// The persona is held by another live session.
    #[error("persona {persona} is held by session {holder}")]
    ReservationConflict { persona: PersonaId, holder: SessionId },

    /// The session holds no persona.
    #[error("session {0} holds no persona")]
    NotHeld(SessionId),

    /// The persona id is not in the catalog.
    #[error("persona not found: {0}")]
    PersonaNotFound(String),

    /// Every persona in the catalog is currently held.
    #[error("no persona is available")]
    NoneAvailable,

    #[error(transparent)]
    Store(#[from] StoreError),
}
