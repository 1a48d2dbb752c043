//! Error types for vault operations.

use std::io;
use thiserror::Error;

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors that can occur when opening, merging, or serializing a vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Decryption failed because the key does not match.
    #[error("invalid key")]
    InvalidKey,

    /// The container bytes are structurally invalid.
    #[error("vault corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The container was written by a newer format version.
    #[error("unsupported vault format version: {version}")]
    UnsupportedVersion {
        /// The version found in the header.
        version: u16,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A cleartext import could not be parsed.
    #[error("import error: {message}")]
    Xml {
        /// Description of the parse failure.
        message: String,
    },
}

impl VaultError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates an import parse error.
    pub fn xml(message: impl Into<String>) -> Self {
        Self::Xml {
            message: message.into(),
        }
    }

    /// Returns true if this error means the supplied key was wrong.
    ///
    /// The sync engine branches on this to surface a remote-key-changed
    /// notification instead of a plain merge failure.
    #[must_use]
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey)
    }
}
