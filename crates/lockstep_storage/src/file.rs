//! Local filesystem backend with change watching.

use crate::backend::{FileStat, Rev, StorageBackend, StorageOpts};
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// How often watcher threads poll for metadata changes.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A handle to one active watch.
struct WatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// The local filesystem backend.
///
/// Revisions are derived from file metadata (modification time and length),
/// so they change whenever another process rewrites the file. A local file
/// can always be re-stated cheaply, which is why the engine never trusts a
/// cached revision for this backend.
///
/// # Watching
///
/// `watch` spawns a polling thread per path that invokes the handler when
/// the file's metadata changes. Notification is raw; the engine debounces.
pub struct FileStorage {
    watches: Mutex<HashMap<String, WatchHandle>>,
}

impl FileStorage {
    /// Creates the filesystem backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            watches: Mutex::new(HashMap::new()),
        }
    }

    fn stat_path(path: &str) -> StorageResult<FileStat> {
        match fs::metadata(path) {
            Ok(meta) => Ok(FileStat::with_rev(Self::rev_from_metadata(&meta))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    fn rev_from_metadata(meta: &fs::Metadata) -> Rev {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Rev::new(format!("{:x}-{:x}", mtime, meta.len()))
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        let mut watches = self.watches.lock();
        for (_, handle) in watches.drain() {
            handle.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = handle.thread {
                let _ = thread.join();
            }
        }
    }
}

impl StorageBackend for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    fn stat(&self, path: &str, _opts: &StorageOpts) -> StorageResult<FileStat> {
        Self::stat_path(path)
    }

    fn load(&self, path: &str, _opts: &StorageOpts) -> StorageResult<(Vec<u8>, FileStat)> {
        let stat = Self::stat_path(path)?;
        let data = fs::read(path)?;
        debug!(path, bytes = data.len(), "loaded file");
        Ok((data, stat))
    }

    fn save(
        &self,
        path: &str,
        _opts: &StorageOpts,
        data: &[u8],
        expected_rev: Option<&Rev>,
    ) -> StorageResult<FileStat> {
        if let Some(expected) = expected_rev {
            match Self::stat_path(path) {
                Ok(stat) => {
                    if stat.rev.as_ref() != Some(expected) {
                        return Err(StorageError::rev_conflict(path));
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, data)?;
        debug!(path, bytes = data.len(), "saved file");
        Self::stat_path(path)
    }

    fn supports_watch(&self) -> bool {
        true
    }

    fn path_for_name(&self, name: &str) -> Option<String> {
        Some(format!("{name}.lsdb"))
    }

    fn watch(
        &self,
        path: &str,
        handler: Box<dyn Fn() + Send + Sync>,
    ) -> StorageResult<()> {
        let mut watches = self.watches.lock();
        if watches.contains_key(path) {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let watched = path.to_string();

        let thread = std::thread::spawn(move || {
            let mut last_rev = fs::metadata(&watched)
                .ok()
                .map(|m| FileStorage::rev_from_metadata(&m));
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::park_timeout(WATCH_POLL_INTERVAL);
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                let rev = fs::metadata(&watched)
                    .ok()
                    .map(|m| FileStorage::rev_from_metadata(&m));
                if rev != last_rev {
                    debug!(path = %watched, "file change detected");
                    last_rev = rev;
                    handler();
                }
            }
        });

        watches.insert(
            path.to_string(),
            WatchHandle {
                stop,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    fn unwatch(&self, path: &str) -> StorageResult<()> {
        let handle = self.watches.lock().remove(path);
        match handle {
            Some(handle) => {
                handle.stop.store(true, Ordering::SeqCst);
                if let Some(thread) = handle.thread {
                    thread.thread().unpark();
                    if thread.join().is_err() {
                        warn!(path, "watcher thread panicked");
                    }
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}
