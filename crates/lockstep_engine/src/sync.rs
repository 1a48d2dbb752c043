//! The sync state machine: reconciling a file against its backend.

use crate::app::{now_millis, App};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::registry::FileInfo;
use lockstep_storage::{StorageBackend, StorageOpts};
use lockstep_vault::{hash_to_hex, FileId, Vault, VaultKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// Overrides for one sync invocation ("save as" to a new backend).
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Target backend tag; defaults to the file's current one.
    pub storage: Option<String>,
    /// Target path; defaults to the file's current one.
    pub path: Option<String>,
    /// Backend-specific opts; defaults to the file's current ones.
    pub opts: Option<StorageOpts>,
    /// Key for decrypting the remote copy when it was re-keyed.
    pub remote_key: Option<VaultKey>,
}

impl SyncOptions {
    /// Creates empty options (sync in place).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target backend.
    #[must_use]
    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    /// Sets the target path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets backend-specific opts.
    #[must_use]
    pub fn with_opts(mut self, opts: StorageOpts) -> Self {
        self.opts = Some(opts);
        self
    }

    /// Supplies a key for the remote copy.
    #[must_use]
    pub fn with_remote_key(mut self, key: VaultKey) -> Self {
        self.remote_key = Some(key);
        self
    }
}

/// States of the reconciliation machine. The attempt counter travels
/// alongside and is never reset within one sync.
enum SyncStep {
    /// Ask the backend for the current revision.
    Stat,
    /// Download the remote copy and merge it in.
    LoadAndMerge,
    /// Serialize, cache if dirty, then upload.
    SaveToCacheAndStorage,
    /// Upload the given bytes guarded by the last-known revision.
    SaveToStorage(Vec<u8>),
}

/// What one machine run produced, fed into the completion terminator.
struct SyncOutcome {
    err: Option<EngineError>,
    saved_to_cache: bool,
    /// Path after any backend remapping on save.
    path: Option<String>,
}

impl App {
    /// Runs one sync cycle for an open file.
    ///
    /// Demo files succeed immediately. A file already syncing is rejected
    /// with [`EngineError::SyncInProgress`] - the `syncing` flag is the
    /// only concurrency control, and there is no queueing.
    ///
    /// # Errors
    ///
    /// Terminal machine errors are returned after the completion
    /// bookkeeping ran; guard rejections return before any state changes.
    pub fn sync_file(&mut self, id: FileId, options: Option<SyncOptions>) -> EngineResult<()> {
        let pos = self
            .open_files
            .iter()
            .position(|f| f.id() == id)
            .ok_or(EngineError::FileNotOpen { id })?;

        if self.open_files[pos].demo() {
            return Ok(());
        }
        if self.open_files[pos].syncing() {
            return Err(EngineError::SyncInProgress);
        }

        // Take the vault out so machine steps can borrow the controller.
        let mut vault = self.open_files.remove(pos);
        let result = self.sync_vault(&mut vault, options.unwrap_or_default());
        self.open_files.insert(pos, vault);
        result
    }

    fn sync_vault(&mut self, vault: &mut Vault, options: SyncOptions) -> EngineResult<()> {
        let storage = options
            .storage
            .clone()
            .or_else(|| vault.storage().map(String::from));
        let mut path = options
            .path
            .clone()
            .or_else(|| vault.path().map(String::from));
        let file_opts = options
            .opts
            .clone()
            .unwrap_or_else(|| vault.opts().clone());

        // A backend switch or a nameless save picks up the backend's
        // path convention; a path from the old backend is never reused
        // against the new one.
        let backend = match &storage {
            Some(tag) => {
                let backend = self.backend(tag)?;
                if path.is_none() || storage.as_deref() != vault.storage() {
                    path = backend.path_for_name(vault.name());
                }
                Some(backend)
            }
            None => None,
        };

        let mut info = self
            .registry
            .get_match(storage.as_deref(), vault.name(), path.as_deref())
            .cloned()
            .unwrap_or_else(|| {
                let mut info = FileInfo::new(vault.cache_id(), vault.name());
                info.storage = storage.clone();
                info.path = path.clone();
                info.open_date = Some(now_millis());
                info
            });

        vault.set_sync_progress();
        debug!(name = %vault.name(), storage = ?storage, "sync started");

        let outcome = match backend {
            None => self.sync_local(vault, &info),
            Some(backend) => self.sync_remote(
                vault,
                &mut info,
                &backend,
                path,
                &file_opts,
                options.remote_key.as_ref(),
            ),
        };

        self.complete_sync(vault, info, storage, file_opts, outcome)
    }

    /// Local-only files only need their cache entry kept current.
    fn sync_local(&mut self, vault: &mut Vault, info: &FileInfo) -> SyncOutcome {
        let path = vault.path().map(String::from);
        if !vault.modified() && info.id == vault.cache_id() {
            return SyncOutcome {
                err: None,
                saved_to_cache: false,
                path,
            };
        }

        let (err, saved) = match self.write_cache(vault, info) {
            Ok(()) => (None, true),
            Err(e) => (Some(e), false),
        };
        SyncOutcome {
            err,
            saved_to_cache: saved,
            path,
        }
    }

    /// The stat / load+merge / save machine for backed files.
    fn sync_remote(
        &mut self,
        vault: &mut Vault,
        info: &mut FileInfo,
        backend: &Arc<dyn StorageBackend>,
        path: Option<String>,
        file_opts: &StorageOpts,
        remote_key: Option<&VaultKey>,
    ) -> SyncOutcome {
        let Some(mut path) = path else {
            return SyncOutcome {
                err: Some(EngineError::NoSource {
                    name: vault.name().to_string(),
                }),
                saved_to_cache: false,
                path: None,
            };
        };

        let mut attempts = 0u32;
        let mut saved_to_cache = false;
        let mut step = SyncStep::Stat;

        let err = loop {
            match step {
                SyncStep::Stat => match backend.stat(&path, file_opts) {
                    Err(e) if e.is_not_found() => {
                        debug!(path, "no remote copy, creating");
                        step = SyncStep::SaveToCacheAndStorage;
                    }
                    Err(e) => {
                        // Keep the local edits safe in the cache before
                        // surfacing the backend failure.
                        if vault.dirty() {
                            if let Ok(()) = self.write_cache(vault, info) {
                                saved_to_cache = true;
                            }
                        }
                        break Some(e.into());
                    }
                    Ok(stat) => {
                        if stat.rev == info.rev {
                            if vault.modified() {
                                step = SyncStep::SaveToCacheAndStorage;
                            } else {
                                break None;
                            }
                        } else {
                            debug!(path, "remote revision changed");
                            step = SyncStep::LoadAndMerge;
                        }
                    }
                },

                SyncStep::LoadAndMerge => {
                    attempts += 1;
                    if attempts > self.config.max_load_attempts {
                        warn!(path, attempts, "merge retry budget exhausted");
                        break Some(EngineError::TooManyLoadAttempts);
                    }
                    let (bytes, stat) = match backend.load(&path, file_opts) {
                        Ok(loaded) => loaded,
                        Err(e) => break Some(e.into()),
                    };
                    match vault.merge_or_update(&bytes, remote_key) {
                        Err(e) if e.is_invalid_key() => {
                            self.events.emit(EngineEvent::RemoteKeyChanged {
                                file_id: vault.id(),
                            });
                            break Some(e.into());
                        }
                        Err(e) => break Some(e.into()),
                        Ok(()) => {
                            info.rev = stat.rev;
                            vault.touch_sync_date();
                            self.events.emit(EngineEvent::Refresh {
                                file_id: vault.id(),
                            });
                            if vault.modified() {
                                step = SyncStep::SaveToCacheAndStorage;
                            } else if vault.dirty() {
                                match self.write_cache(vault, info) {
                                    Ok(()) => {
                                        saved_to_cache = true;
                                        break None;
                                    }
                                    Err(e) => break Some(e),
                                }
                            } else {
                                break None;
                            }
                        }
                    }
                }

                SyncStep::SaveToCacheAndStorage => {
                    let data = match vault.get_data() {
                        Ok(data) => data,
                        Err(e) => break Some(e.into()),
                    };
                    if vault.dirty() {
                        match self.cache.save(&info.id.to_string(), &data) {
                            Ok(()) => {
                                vault.mark_cached();
                                saved_to_cache = true;
                            }
                            Err(e) => break Some(e.into()),
                        }
                    }
                    step = SyncStep::SaveToStorage(data);
                }

                SyncStep::SaveToStorage(data) => {
                    match backend.save(&path, file_opts, &data, info.rev.as_ref()) {
                        Err(e) if e.is_rev_conflict() => {
                            debug!(path, "save hit a revision conflict, merging");
                            step = SyncStep::LoadAndMerge;
                        }
                        Err(e) => break Some(e.into()),
                        Ok(stat) => {
                            info.rev = stat.rev;
                            if let Some(remapped) = stat.path {
                                path = remapped;
                            }
                            vault.touch_sync_date();
                            break None;
                        }
                    }
                }
            }
        };

        SyncOutcome {
            err,
            saved_to_cache,
            path: Some(path),
        }
    }

    /// Serializes the vault into its cache slot and clears `dirty`.
    fn write_cache(&mut self, vault: &mut Vault, info: &FileInfo) -> EngineResult<()> {
        let data = vault.get_data()?;
        self.cache.save(&info.id.to_string(), &data)?;
        vault.mark_cached();
        Ok(())
    }

    /// The single completion terminator: every sync ends here.
    fn complete_sync(
        &mut self,
        vault: &mut Vault,
        mut info: FileInfo,
        storage: Option<String>,
        file_opts: StorageOpts,
        outcome: SyncOutcome,
    ) -> EngineResult<()> {
        let SyncOutcome {
            err,
            saved_to_cache,
            path,
        } = outcome;
        let err_str = err.as_ref().map(ToString::to_string);

        vault.set_sync_complete(
            path.as_deref(),
            storage.as_deref(),
            err_str.as_deref(),
            saved_to_cache || err.is_none(),
        );
        vault.set_cache_id(info.id);
        vault.set_opts(file_opts.clone());
        vault.set_rev(info.rev.as_ref().map(|r| r.as_str().to_string()));

        info.name = vault.name().to_string();
        info.storage = storage.clone();
        info.path = path;
        info.opts = match storage.as_deref().and_then(|tag| self.backend(tag).ok()) {
            Some(backend) => backend.file_opts_to_store_opts(&file_opts),
            None => file_opts,
        };
        info.modified = vault.modified();
        info.edit_state = vault.local_edit_state().map(<[u8]>::to_vec);
        info.sync_date = vault.sync_date();
        if self.config.remember_key_files {
            if let Some(hash) = vault.key_file_hash() {
                info.key_file_hash = Some(hash_to_hex(hash));
            }
        } else {
            info.key_file_name = None;
            info.key_file_hash = None;
        }

        self.registry.unshift(info);
        self.save_registry();

        match err {
            Some(e) => {
                debug!(name = %vault.name(), error = %e, "sync failed");
                Err(e)
            }
            None => {
                debug!(name = %vault.name(), "sync complete");
                Ok(())
            }
        }
    }
}
