//! Error types for storage and cache operations.

use std::io;
use thiserror::Error;

/// Result type for storage backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for cache store operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during storage backend operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested file does not exist on the backend.
    ///
    /// During a stat on the save path this means "create new"; during a
    /// load it is a hard error.
    #[error("not found: {path}")]
    NotFound {
        /// Path that was requested.
        path: String,
    },

    /// The backend rejected a save because the expected revision no longer
    /// matches the stored one.
    #[error("revision conflict at {path}")]
    RevConflict {
        /// Path that conflicted.
        path: String,
    },

    /// The backend does not support the requested capability.
    #[error("operation not supported by this backend: {op}")]
    Unsupported {
        /// Name of the unsupported operation.
        op: String,
    },

    /// A backend-specific failure.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

impl StorageError {
    /// Creates a not-found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates a revision-conflict error.
    pub fn rev_conflict(path: impl Into<String>) -> Self {
        Self::RevConflict { path: path.into() }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported { op: op.into() }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns true if this error means the file does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this error is a server-side revision mismatch.
    #[must_use]
    pub fn is_rev_conflict(&self) -> bool {
        matches!(self, Self::RevConflict { .. })
    }
}

/// Errors that can occur in the local cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O error occurred.
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    /// No cache entry exists under the given id.
    #[error("no cache entry for {id}")]
    Missing {
        /// The cache key that was requested.
        id: String,
    },

    /// A store-specific failure.
    #[error("cache error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

impl CacheError {
    /// Creates a missing-entry error.
    pub fn missing(id: impl Into<String>) -> Self {
        Self::Missing { id: id.into() }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns true if this error means the entry does not exist.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}
