//! In-memory backend, used as the remote-provider double in tests.

use crate::backend::{FileStat, Rev, StorageBackend, StorageOpts};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// A stored file: contents plus a monotonically increasing revision.
#[derive(Debug, Clone)]
struct StoredFile {
    data: Vec<u8>,
    rev: u64,
}

/// An in-process storage backend with controllable failures.
///
/// This backend stands in for a remote cloud provider. Revisions are
/// integers bumped on every save, so revision-conflict and remote-change
/// scenarios can be scripted precisely:
///
/// - [`put_remote`](MemoryStorage::put_remote) simulates a concurrent
///   writer bumping the revision behind the engine's back
/// - `fail_*` toggles make individual operations return backend errors
/// - [`set_always_conflict_on_save`](MemoryStorage::set_always_conflict_on_save)
///   makes every save report a revision conflict
/// - operation counters allow zero-I/O assertions
#[derive(Default)]
pub struct MemoryStorage {
    tag: String,
    files: RwLock<HashMap<String, StoredFile>>,
    next_rev: AtomicU64,
    fail_stat: AtomicBool,
    fail_load: AtomicBool,
    fail_save: AtomicBool,
    always_conflict: AtomicBool,
    conflict_next_save: AtomicBool,
    stat_count: AtomicUsize,
    load_count: AtomicUsize,
    save_count: AtomicUsize,
}

impl MemoryStorage {
    /// Creates an empty in-memory backend registered under `tag`.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            next_rev: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// Writes a file as if another client had saved it, bumping the rev.
    pub fn put_remote(&self, path: &str, data: impl Into<Vec<u8>>) -> Rev {
        let rev = self.next_rev.fetch_add(1, Ordering::SeqCst);
        self.files.write().insert(
            path.to_string(),
            StoredFile {
                data: data.into(),
                rev,
            },
        );
        Rev::new(rev.to_string())
    }

    /// Removes a file from the backend.
    pub fn delete_remote(&self, path: &str) {
        self.files.write().remove(path);
    }

    /// Returns the raw stored bytes, if present.
    #[must_use]
    pub fn raw(&self, path: &str) -> Option<Vec<u8>> {
        self.files.read().get(path).map(|f| f.data.clone())
    }

    /// Makes `stat` fail with a backend error.
    pub fn set_fail_stat(&self, fail: bool) {
        self.fail_stat.store(fail, Ordering::SeqCst);
    }

    /// Makes `load` fail with a backend error.
    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    /// Makes `save` fail with a backend error.
    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }

    /// Makes every save report a revision conflict.
    pub fn set_always_conflict_on_save(&self, conflict: bool) {
        self.always_conflict.store(conflict, Ordering::SeqCst);
    }

    /// Makes only the next save report a revision conflict, simulating a
    /// concurrent writer landing between a stat and the save.
    pub fn set_conflict_next_save(&self) {
        self.conflict_next_save.store(true, Ordering::SeqCst);
    }

    /// Number of `stat` calls observed.
    #[must_use]
    pub fn stat_count(&self) -> usize {
        self.stat_count.load(Ordering::SeqCst)
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

    fn rev_of(rev: u64) -> Rev {
        Rev::new(rev.to_string())
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        &self.tag
    }

    fn stat(&self, path: &str, _opts: &StorageOpts) -> StorageResult<FileStat> {
        self.stat_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_stat.load(Ordering::SeqCst) {
            return Err(StorageError::backend("stat failure injected"));
        }
        match self.files.read().get(path) {
            Some(file) => Ok(FileStat::with_rev(Self::rev_of(file.rev))),
            None => Err(StorageError::not_found(path)),
        }
    }

    fn load(&self, path: &str, _opts: &StorageOpts) -> StorageResult<(Vec<u8>, FileStat)> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StorageError::backend("load failure injected"));
        }
        match self.files.read().get(path) {
            Some(file) => Ok((file.data.clone(), FileStat::with_rev(Self::rev_of(file.rev)))),
            None => Err(StorageError::not_found(path)),
        }
    }

    fn save(
        &self,
        path: &str,
        _opts: &StorageOpts,
        data: &[u8],
        expected_rev: Option<&Rev>,
    ) -> StorageResult<FileStat> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(StorageError::backend("save failure injected"));
        }
        if self.always_conflict.load(Ordering::SeqCst) {
            return Err(StorageError::rev_conflict(path));
        }
        if self.conflict_next_save.swap(false, Ordering::SeqCst) {
            return Err(StorageError::rev_conflict(path));
        }

        let mut files = self.files.write();
        if let (Some(expected), Some(current)) = (expected_rev, files.get(path)) {
            if Self::rev_of(current.rev) != *expected {
                return Err(StorageError::rev_conflict(path));
            }
        }

        let rev = self.next_rev.fetch_add(1, Ordering::SeqCst);
        files.insert(
            path.to_string(),
            StoredFile {
                data: data.to_vec(),
                rev,
            },
        );
        Ok(FileStat::with_rev(Self::rev_of(rev)))
    }

    fn path_for_name(&self, name: &str) -> Option<String> {
        Some(format!("/{name}.lsdb"))
    }
}
