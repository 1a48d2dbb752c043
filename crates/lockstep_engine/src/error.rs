//! Error types for the engine.

use lockstep_storage::{CacheError, StorageError};
use lockstep_vault::{FileId, VaultError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during open, sync, and controller operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cache store failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Vault open/merge/serialize failure.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// A file with the same content id is already open.
    #[error("file already open: {id}")]
    DuplicateFile {
        /// The content-derived id of the file.
        id: FileId,
    },

    /// A sync is already running for this file.
    #[error("sync in progress")]
    SyncInProgress,

    /// The merge retry loop exhausted its attempt budget.
    #[error("too many load attempts")]
    TooManyLoadAttempts,

    /// No backend is registered under this tag.
    #[error("unknown storage backend: {name}")]
    UnknownStorage {
        /// The backend tag looked up.
        name: String,
    },

    /// No open file has this id.
    #[error("file not open: {id}")]
    FileNotOpen {
        /// The file id looked up.
        id: FileId,
    },

    /// The open request names no usable source for the file.
    #[error("no source to open {name} from")]
    NoSource {
        /// Display name from the request.
        name: String,
    },

    /// The file-info registry could not be persisted or loaded.
    #[error("registry error: {message}")]
    Registry {
        /// Description of the failure.
        message: String,
    },
}

impl EngineError {
    /// Creates a registry error.
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Returns true if this is a merge failure caused by a key change.
    #[must_use]
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::Vault(e) if e.is_invalid_key())
    }

    /// Returns true if a concurrent sync caused the rejection.
    #[must_use]
    pub fn is_sync_in_progress(&self) -> bool {
        matches!(self, Self::SyncInProgress)
    }
}
