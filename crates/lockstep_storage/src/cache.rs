//! Content-addressed cache store for serialized vault bytes.

use crate::error::{CacheError, CacheResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

/// The always-present local store of raw encrypted file bytes.
///
/// Entries are keyed by file-info id. The cache never fails due to
/// conflicts; only local I/O can fail.
pub trait Cache: Send + Sync {
    /// Reads the cached bytes for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Missing`] if no entry exists.
    fn load(&self, id: &str) -> CacheResult<Vec<u8>>;

    /// Writes the cached bytes for `id`, replacing any previous entry.
    fn save(&self, id: &str, data: &[u8]) -> CacheResult<()>;

    /// Removes the entry for `id`. Removing a missing entry is not an error.
    fn remove(&self, id: &str) -> CacheResult<()>;

    /// Returns true if an entry exists for `id`.
    fn contains(&self, id: &str) -> bool;
}

/// A cache storing one file per id under a directory.
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    /// Opens (creating if needed) a cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

impl Cache for DirCache {
    fn load(&self, id: &str) -> CacheResult<Vec<u8>> {
        match fs::read(self.entry_path(id)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::missing(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, id: &str, data: &[u8]) -> CacheResult<()> {
        fs::write(self.entry_path(id), data)?;
        debug!(id, bytes = data.len(), "cache entry written");
        Ok(())
    }

    fn remove(&self, id: &str) -> CacheResult<()> {
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.entry_path(id).exists()
    }
}

/// A map-backed cache with controllable failures, for tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    fail_save: AtomicBool,
    load_count: AtomicUsize,
    save_count: AtomicUsize,
}

impl MemoryCache {
    /// Creates an empty in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `save` fail with a backend error.
    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }

    /// Number of `load` calls observed.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Number of `save` calls observed.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

impl Cache for MemoryCache {
    fn load(&self, id: &str) -> CacheResult<Vec<u8>> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::missing(id))
    }

    fn save(&self, id: &str, data: &[u8]) -> CacheResult<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(CacheError::backend("save failure injected"));
        }
        self.entries.write().insert(id.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, id: &str) -> CacheResult<()> {
        self.entries.write().remove(id);
        Ok(())
    }

    fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }
}
