//! Open orchestration: deciding which source a file loads from.

use crate::app::{now_millis, App};
use crate::error::{EngineError, EngineResult};
use crate::registry::FileInfo;
use lockstep_storage::{Rev, StorageOpts};
use lockstep_vault::{hash_from_hex, hash_to_hex, FileId, Vault, VaultKey};
use tracing::{debug, warn};

/// Where the key file for an open request comes from.
#[derive(Clone)]
pub enum KeyFileSource {
    /// No key file.
    None,
    /// Key-file contents supplied by the caller.
    Bytes {
        /// File name, kept as a registry hint.
        name: String,
        /// Raw key-file contents.
        data: Vec<u8>,
    },
    /// A remembered key-file hash (hex) from an earlier session.
    RememberedHash(String),
}

impl std::fmt::Debug for KeyFileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bytes { name, .. } => f
                .debug_struct("Bytes")
                .field("name", name)
                .field("data", &"[REDACTED]")
                .finish(),
            Self::RememberedHash(_) => f.write_str("RememberedHash"),
        }
    }
}

/// One request to open a database file.
#[derive(Clone)]
pub struct OpenRequest {
    /// Registry id, when the caller opens a known file.
    pub id: Option<FileId>,
    /// Backend tag, or `None` for a local-only file.
    pub storage: Option<String>,
    /// Display name.
    pub name: String,
    /// Backend path.
    pub path: Option<String>,
    /// Backend-specific opts.
    pub opts: Option<StorageOpts>,
    /// Revision the caller believes is current.
    pub rev: Option<Rev>,
    /// Master password.
    pub password: String,
    /// Key-file source.
    pub key_file: KeyFileSource,
    /// Raw container bytes, when the caller already has them.
    pub file_data: Option<Vec<u8>>,
}

impl OpenRequest {
    /// Creates a request with only name and password set.
    #[must_use]
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: None,
            storage: None,
            name: name.into(),
            path: None,
            opts: None,
            rev: None,
            password: password.into(),
            key_file: KeyFileSource::None,
            file_data: None,
        }
    }

    /// Targets a known registry record.
    #[must_use]
    pub fn with_id(mut self, id: FileId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the backend tag.
    #[must_use]
    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    /// Sets the backend path.
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

    /// Sets the revision the caller believes is current.
    #[must_use]
    pub fn with_rev(mut self, rev: impl Into<Rev>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    /// Sets the key-file source.
    #[must_use]
    pub fn with_key_file(mut self, key_file: KeyFileSource) -> Self {
        self.key_file = key_file;
        self
    }

    /// Supplies container bytes directly.
    #[must_use]
    pub fn with_file_data(mut self, data: Vec<u8>) -> Self {
        self.file_data = Some(data);
        self
    }
}

impl std::fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRequest")
            .field("id", &self.id)
            .field("storage", &self.storage)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("rev", &self.rev)
            .field("password", &"[REDACTED]")
            .field("file_data", &self.file_data.as_ref().map(Vec::len))
            .finish()
    }
}

/// Where the opened bytes came from; decides rev and cache handling.
enum OpenSource {
    /// Loaded from the cache.
    Cache,
    /// Fetched from a backend; carries the fetched revision.
    Backend(Option<Rev>),
    /// Supplied by the caller.
    Supplied,
}

impl App {
    /// Opens a database file, choosing the source per the engine rules.
    ///
    /// First matching clause wins: a registry record with unsynced edits
    /// opens from cache and schedules reconciliation; supplied bytes are
    /// used directly; local-only files come from cache; a fresh cached
    /// revision short-circuits the backend; local files and first-time
    /// opens go stat-then-load with cache fallback; everything else opens
    /// from cache and schedules reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateFile`] when the decrypted content
    /// id is already open, [`EngineError::NoSource`] when the request
    /// names no usable source, and decrypt/storage/cache errors verbatim.
    pub fn open_file(&mut self, req: OpenRequest) -> EngineResult<FileId> {
        let info: Option<FileInfo> = match req.id {
            Some(ref id) => self.registry.get(id).cloned(),
            None => self
                .registry
                .get_match(req.storage.as_deref(), &req.name, req.path.as_deref())
                .cloned(),
        };
        let key = self.resolve_key(&req, info.as_ref());

        // Unsynced local edits: the cache is the freshest copy.
        if let Some(info) = info.clone().filter(|i| i.modified) {
            debug!(name = %req.name, "opening modified file from cache");
            return self.open_from_cache(&req, key, info, true);
        }

        if let Some(data) = req.file_data.clone() {
            return self.open_with_bytes(&req, key, info, data, None, OpenSource::Supplied);
        }

        let Some(storage) = req.storage.clone() else {
            let info = info.ok_or_else(|| EngineError::NoSource {
                name: req.name.clone(),
            })?;
            return self.open_from_cache(&req, key, info, false);
        };

        // A matching cached revision makes the cache authoritative,
        // except for local files whose revs are never trusted.
        if let Some(info) = info
            .clone()
            .filter(|i| i.rev == req.rev && storage != "file")
        {
            debug!(name = %req.name, "cached revision is current");
            return self.open_from_cache(&req, key, info, false);
        }

        match info {
            // Cached but possibly stale: open fast, reconcile after.
            Some(info) if storage != "file" => self.open_from_cache(&req, key, info, true),
            // First-time open, or a local file whose cached rev is never
            // trusted: ask the backend.
            info => self.open_via_backend(&req, key, info, &storage),
        }
    }

    /// Stat-then-load against the backend, with cache fallback.
    fn open_via_backend(
        &mut self,
        req: &OpenRequest,
        key: VaultKey,
        info: Option<FileInfo>,
        storage: &str,
    ) -> EngineResult<FileId> {
        let backend = self.backend(storage)?;
        let file_opts = self.effective_opts(req, info.as_ref(), storage);
        let path = req
            .path
            .clone()
            .or_else(|| info.as_ref().and_then(|i| i.path.clone()))
            .or_else(|| backend.path_for_name(&req.name))
            .ok_or_else(|| EngineError::NoSource {
                name: req.name.clone(),
            })?;

        if let Some(info) = info.as_ref() {
            if info.rev.is_some() && backend.supports_stat() {
                match backend.stat(&path, &file_opts) {
                    Err(e) => {
                        debug!(name = %req.name, error = %e, "stat failed, using cache");
                        return self.open_from_cache(req, key, info.clone(), false);
                    }
                    Ok(stat) if stat.rev == info.rev => {
                        return self.open_from_cache(req, key, info.clone(), false);
                    }
                    Ok(_) => {}
                }
            }
        }

        match backend.load(&path, &file_opts) {
            Ok((bytes, stat)) => self.open_with_bytes(
                req,
                key,
                info,
                bytes,
                Some(path),
                OpenSource::Backend(stat.rev),
            ),
            Err(e) => match info {
                Some(info) => {
                    warn!(name = %req.name, error = %e, "backend load failed, using cache");
                    self.open_from_cache(req, key, info, false)
                }
                None => Err(e.into()),
            },
        }
    }

    fn open_from_cache(
        &mut self,
        req: &OpenRequest,
        key: VaultKey,
        info: FileInfo,
        sync_after: bool,
    ) -> EngineResult<FileId> {
        let bytes = self.cache.load(&info.id.to_string())?;
        let vault = Vault::open(&req.name, key, &bytes)?;
        self.finalize_open(
            req,
            Some(info),
            vault,
            None,
            None,
            OpenSource::Cache,
            sync_after,
        )
    }

    fn open_with_bytes(
        &mut self,
        req: &OpenRequest,
        key: VaultKey,
        info: Option<FileInfo>,
        bytes: Vec<u8>,
        resolved_path: Option<String>,
        source: OpenSource,
    ) -> EngineResult<FileId> {
        let vault = Vault::open(&req.name, key, &bytes)?;
        self.finalize_open(req, info, vault, Some(bytes), resolved_path, source, false)
    }

    /// Registers a successfully decrypted vault: cache binding, registry
    /// record, open-set insertion, and file watching.
    #[allow(clippy::too_many_arguments)]
    fn finalize_open(
        &mut self,
        req: &OpenRequest,
        info: Option<FileInfo>,
        mut vault: Vault,
        cache_bytes: Option<Vec<u8>>,
        resolved_path: Option<String>,
        source: OpenSource,
        sync_after: bool,
    ) -> EngineResult<FileId> {
        if self.open_files.iter().any(|f| f.id() == vault.id()) {
            return Err(EngineError::DuplicateFile { id: vault.id() });
        }

        let cache_id = info.as_ref().map(|i| i.id).unwrap_or_else(FileId::new);
        let storage = req.storage.clone();
        let path = resolved_path
            .or_else(|| req.path.clone())
            .or_else(|| info.as_ref().and_then(|i| i.path.clone()));
        let file_opts = match &storage {
            Some(tag) => self.effective_opts(req, info.as_ref(), tag),
            None => req.opts.clone().unwrap_or_default(),
        };
        let rev = match &source {
            OpenSource::Cache => info.as_ref().and_then(|i| i.rev.clone()),
            OpenSource::Backend(rev) => rev.clone(),
            OpenSource::Supplied => req.rev.clone(),
        };

        vault.set_cache_id(cache_id);
        vault.set_storage(storage.clone());
        vault.set_path(path.clone());
        vault.set_opts(file_opts.clone());
        vault.set_rev(rev.as_ref().map(|r| r.as_str().to_string()));

        if let Some(info) = info.as_ref().filter(|i| i.modified) {
            vault.mark_modified();
            vault.set_local_edit_state(info.edit_state.clone());
        }

        // Bytes that did not come from the cache belong in it.
        if let Some(bytes) = cache_bytes {
            vault.mark_dirty();
            match self.cache.save(&cache_id.to_string(), &bytes) {
                Ok(()) => vault.mark_cached(),
                Err(e) => warn!(id = %cache_id, error = %e, "cache write failed on open"),
            }
        }

        let fetched = matches!(source, OpenSource::Backend(_));
        let mut record = FileInfo::new(cache_id, &req.name);
        record.storage = storage.clone();
        record.path = path.clone();
        record.opts = match (&storage, self.backend_if_known(&storage)) {
            (Some(_), Some(backend)) => backend.file_opts_to_store_opts(&file_opts),
            _ => file_opts.clone(),
        };
        record.rev = rev;
        record.modified = vault.modified();
        record.edit_state = vault.local_edit_state().map(<[u8]>::to_vec);
        record.sync_date = if fetched {
            Some(now_millis())
        } else {
            info.as_ref().and_then(|i| i.sync_date)
        };
        record.open_date = Some(now_millis());
        if self.config.remember_key_files {
            record.key_file_name = match &req.key_file {
                KeyFileSource::Bytes { name, .. } => Some(name.clone()),
                _ => info.as_ref().and_then(|i| i.key_file_name.clone()),
            };
            record.key_file_hash = vault.key_file_hash().map(hash_to_hex);
        }
        self.registry.unshift(record);
        self.save_registry();

        let id = self.add_to_open_set(vault)?;

        if storage.as_deref() == Some("file") {
            if let Some(path) = &path {
                self.start_watch(id, "file", path);
            }
        }
        if sync_after {
            self.enqueue_sync(id);
        }
        debug!(%id, name = %req.name, "file opened");
        Ok(id)
    }

    /// File-level opts for backend calls: request opts win, then the
    /// registry record's persisted opts translated back.
    fn effective_opts(
        &self,
        req: &OpenRequest,
        info: Option<&FileInfo>,
        storage: &str,
    ) -> StorageOpts {
        if let Some(opts) = &req.opts {
            return opts.clone();
        }
        match (info, self.backend(storage).ok()) {
            (Some(info), Some(backend)) => backend.store_opts_to_file_opts(&info.opts),
            (Some(info), None) => info.opts.clone(),
            _ => StorageOpts::new(),
        }
    }

    fn backend_if_known(
        &self,
        storage: &Option<String>,
    ) -> Option<std::sync::Arc<dyn lockstep_storage::StorageBackend>> {
        storage.as_deref().and_then(|tag| self.backend(tag).ok())
    }

    /// Builds key material from the request, falling back to a remembered
    /// key-file hash when enabled.
    fn resolve_key(&self, req: &OpenRequest, info: Option<&FileInfo>) -> VaultKey {
        match &req.key_file {
            KeyFileSource::Bytes { data, .. } => VaultKey::new(&req.password, data),
            KeyFileSource::RememberedHash(hex) => match hash_from_hex(hex) {
                Some(hash) => VaultKey::with_key_file_hash(&req.password, hash),
                None => VaultKey::from_password(&req.password),
            },
            KeyFileSource::None => {
                if self.config.remember_key_files {
                    if let Some(hash) = info
                        .and_then(|i| i.key_file_hash.as_deref())
                        .and_then(hash_from_hex)
                    {
                        return VaultKey::with_key_file_hash(&req.password, hash);
                    }
                }
                VaultKey::from_password(&req.password)
            }
        }
    }
}
