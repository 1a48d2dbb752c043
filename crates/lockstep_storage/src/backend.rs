//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};
use std::collections::BTreeMap;
use std::fmt;

/// An opaque revision token issued by a storage backend.
///
/// Revisions are compared for equality only - there is no ordering and no
/// structure the engine may rely on. A backend that cannot produce
/// revisions simply omits them, which callers treat as "unknown, always
/// reload".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rev(String);

impl Rev {
    /// Creates a revision token from its string form.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Rev {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for Rev {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Metadata a backend reports for a stored file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    /// Current revision token, if the backend tracks revisions.
    pub rev: Option<Rev>,
    /// Remapped path, if the backend relocated the file on save.
    pub path: Option<String>,
}

impl FileStat {
    /// Creates a stat carrying only a revision.
    pub fn with_rev(rev: impl Into<Rev>) -> Self {
        Self {
            rev: Some(rev.into()),
            path: None,
        }
    }
}

/// Backend-specific options, persisted alongside a file's metadata.
///
/// The engine never interprets these; it only shuttles them between the
/// file-info registry and the backend's opts translators.
pub type StorageOpts = BTreeMap<String, String>;

/// A pluggable storage provider for encrypted vault files.
///
/// Backends are looked up by [`name`](StorageBackend::name) in the
/// application controller's registry. Every call is synchronous; the
/// engine sequences them itself.
///
/// # Invariants
///
/// - `load` returns exactly the bytes most recently saved at that path
/// - `save` with `expected_rev` must fail with a revision conflict when
///   the stored revision differs
/// - Revision tokens are compared for equality only
///
/// # Optional capabilities
///
/// `stat`, `watch`/`unwatch` and `path_for_name` are optional. Callers
/// check [`supports_stat`](StorageBackend::supports_stat) /
/// [`supports_watch`](StorageBackend::supports_watch) before relying on
/// them; unsupported default implementations return
/// [`StorageError::Unsupported`].
pub trait StorageBackend: Send + Sync {
    /// Backend tag, used for registry lookup and file-info persistence.
    fn name(&self) -> &str;

    /// Fetches metadata for a stored file without downloading it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no file exists at `path`, or
    /// a backend failure.
    fn stat(&self, path: &str, opts: &StorageOpts) -> StorageResult<FileStat>;

    /// Downloads a stored file together with its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no file exists at `path`, or
    /// a backend failure.
    fn load(&self, path: &str, opts: &StorageOpts) -> StorageResult<(Vec<u8>, FileStat)>;

    /// Uploads file contents, optionally guarded by an expected revision.
    ///
    /// The returned stat carries the new revision and, when the backend
    /// relocates files on save, the remapped path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RevConflict`] when `expected_rev` is given
    /// and no longer matches the stored revision.
    fn save(
        &self,
        path: &str,
        opts: &StorageOpts,
        data: &[u8],
        expected_rev: Option<&Rev>,
    ) -> StorageResult<FileStat>;

    /// Whether [`stat`](StorageBackend::stat) is usable on this backend.
    fn supports_stat(&self) -> bool {
        true
    }

    /// Whether [`watch`](StorageBackend::watch) is usable on this backend.
    fn supports_watch(&self) -> bool {
        false
    }

    /// Computes the conventional path for a file name, if the backend has
    /// a name-to-path convention.
    fn path_for_name(&self, _name: &str) -> Option<String> {
        None
    }

    /// Starts change notification for `path`, invoking `handler` on every
    /// observed change. Callers are expected to debounce.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] unless
    /// [`supports_watch`](StorageBackend::supports_watch) is true.
    fn watch(
        &self,
        _path: &str,
        _handler: Box<dyn Fn() + Send + Sync>,
    ) -> StorageResult<()> {
        Err(StorageError::unsupported("watch"))
    }

    /// Stops change notification for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] unless
    /// [`supports_watch`](StorageBackend::supports_watch) is true.
    fn unwatch(&self, _path: &str) -> StorageResult<()> {
        Err(StorageError::unsupported("unwatch"))
    }

    /// Translates in-memory file opts into their persisted form.
    fn file_opts_to_store_opts(&self, opts: &StorageOpts) -> StorageOpts {
        opts.clone()
    }

    /// Translates persisted opts back into their in-memory form.
    fn store_opts_to_file_opts(&self, opts: &StorageOpts) -> StorageOpts {
        opts.clone()
    }
}
