//! Application controller: the open-file set and everything around it.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::registry::FileInfoRegistry;
use crate::watch::Debouncer;
use lockstep_storage::{Cache, FileStorage, StorageBackend};
use lockstep_vault::{FileId, Vault, VaultKey};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// One active file watch: the backend it runs on and its debouncer.
struct FileWatch {
    storage: String,
    path: String,
    debouncer: Debouncer,
}

/// The application controller.
///
/// Owns the open-file set, the backend registry, the cache store, the
/// file-info registry, and the event port. All operations are synchronous
/// methods on `&mut self`; deferred work lands in a queue drained by
/// [`process_pending`](App::process_pending).
pub struct App {
    pub(crate) config: EngineConfig,
    backends: BTreeMap<String, Arc<dyn StorageBackend>>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) registry: FileInfoRegistry,
    pub(crate) open_files: Vec<Vault>,
    pub(crate) events: EventBus,
    pending: VecDeque<FileId>,
    watch_tx: Sender<FileId>,
    watch_rx: Receiver<FileId>,
    watchers: HashMap<FileId, FileWatch>,
}

impl App {
    /// Creates a controller with the local filesystem backend registered.
    ///
    /// The file-info registry is loaded from `config.registry_path` when
    /// set, and kept in memory otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when a persisted registry exists but cannot be
    /// decoded.
    pub fn new(config: EngineConfig, cache: Arc<dyn Cache>) -> EngineResult<Self> {
        let registry = match &config.registry_path {
            Some(path) => FileInfoRegistry::load_from(path)?,
            None => FileInfoRegistry::new(),
        };

        let (watch_tx, watch_rx) = mpsc::channel();
        let mut app = Self {
            config,
            backends: BTreeMap::new(),
            cache,
            registry,
            open_files: Vec::new(),
            events: EventBus::new(),
            pending: VecDeque::new(),
            watch_tx,
            watch_rx,
            watchers: HashMap::new(),
        };
        app.register_storage(Arc::new(FileStorage::new()));
        Ok(app)
    }

    /// Registers a storage backend under its own tag.
    pub fn register_storage(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Looks up a backend by tag.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownStorage`] for unregistered tags.
    pub fn backend(&self, tag: &str) -> EngineResult<Arc<dyn StorageBackend>> {
        self.backends
            .get(tag)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStorage {
                name: tag.to_string(),
            })
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Returns an open file by id.
    #[must_use]
    pub fn file(&self, id: &FileId) -> Option<&Vault> {
        self.open_files.iter().find(|f| f.id() == *id)
    }

    /// Returns an open file by id, mutably.
    pub fn file_mut(&mut self, id: &FileId) -> Option<&mut Vault> {
        self.open_files.iter_mut().find(|f| f.id() == *id)
    }

    /// Returns an open file by name.
    #[must_use]
    pub fn file_by_name(&self, name: &str) -> Option<&Vault> {
        self.open_files.iter().find(|f| f.name() == name)
    }

    /// Iterates the open files.
    pub fn files(&self) -> impl Iterator<Item = &Vault> {
        self.open_files.iter()
    }

    /// Number of open files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.open_files.len()
    }

    /// Read access to the file-info registry.
    #[must_use]
    pub fn registry(&self) -> &FileInfoRegistry {
        &self.registry
    }

    /// Creates a fresh local file and adds it to the open set.
    ///
    /// The file enters no registry record until its first sync.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateFile`] if the fresh id collides
    /// with an open file.
    pub fn create_new_file(
        &mut self,
        name: impl Into<String>,
        key: VaultKey,
    ) -> EngineResult<FileId> {
        self.add_to_open_set(Vault::create(name, key))
    }

    /// Creates a throwaway demo file with sample entries.
    ///
    /// Demo files report sync success without doing any work.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateFile`] if the fresh id collides
    /// with an open file.
    pub fn create_demo_file(&mut self) -> EngineResult<FileId> {
        let mut vault = Vault::create("demo", VaultKey::from_password("demo"));
        vault.set_demo(true);

        let mut fields = BTreeMap::new();
        fields.insert("UserName".to_string(), "demo".to_string());
        fields.insert("Password".to_string(), "demo".to_string());
        vault.upsert_entry(None, "Samples", "example.com", fields.clone());
        vault.upsert_entry(None, "Samples", "mail.example.com", fields);

        self.add_to_open_set(vault)
    }

    /// Builds a file from a cleartext XML export and adds it to the open
    /// set. Like the other open-family operations this returns the id on
    /// success.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Vault`] when the export cannot be parsed.
    pub fn import_file_with_xml(
        &mut self,
        name: impl Into<String>,
        key: VaultKey,
        xml: &str,
    ) -> EngineResult<FileId> {
        let vault = Vault::import_xml(name, key, xml)?;
        self.add_to_open_set(vault)
    }

    /// Closes one open file.
    ///
    /// Releases its watcher, persists its terminal registry state, and
    /// removes it from the open set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::FileNotOpen`] for unknown ids.
    pub fn close_file(&mut self, id: &FileId) -> EngineResult<()> {
        let pos = self
            .open_files
            .iter()
            .position(|f| f.id() == *id)
            .ok_or(EngineError::FileNotOpen { id: *id })?;

        self.stop_watch(id);

        let mut vault = self.open_files.remove(pos);
        let cache_id = vault.cache_id();
        let mut registry_touched = false;
        if let Some(info) = self.registry.get_mut(&cache_id) {
            info.modified = vault.modified();
            info.edit_state = vault.local_edit_state().map(<[u8]>::to_vec);
            registry_touched = true;
        }
        if registry_touched {
            self.save_registry();
        }
        vault.close();
        debug!(%id, "file closed");
        Ok(())
    }

    /// Closes every open file.
    pub fn close_all_files(&mut self) {
        let ids: Vec<FileId> = self.open_files.iter().map(Vault::id).collect();
        for id in ids {
            let _ = self.close_file(&id);
        }
    }

    /// Removes a registry record and its cached bytes.
    ///
    /// The cache entry survives while the file is still open, since the
    /// open file may need to re-cache through it.
    pub fn remove_file_info(&mut self, id: &FileId) -> EngineResult<()> {
        self.registry.remove(id);
        let still_open = self.open_files.iter().any(|f| f.cache_id() == *id);
        if !still_open {
            self.cache.remove(&id.to_string())?;
        }
        self.save_registry();
        Ok(())
    }

    /// Strips stored key-file hints from every registry record.
    pub fn clear_stored_key_files(&mut self) {
        for info in self.registry.iter_mut() {
            info.key_file_name = None;
            info.key_file_hash = None;
        }
        self.save_registry();
    }

    /// Drains deferred syncs and debounced watch notifications.
    ///
    /// Returns the outcome per file. Files closed since enqueueing are
    /// skipped.
    pub fn process_pending(&mut self) -> Vec<(FileId, EngineResult<()>)> {
        let mut ids: Vec<FileId> = self.pending.drain(..).collect();
        while let Ok(id) = self.watch_rx.try_recv() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let mut results = Vec::new();
        for id in ids {
            if self.file(&id).is_none() {
                continue;
            }
            let result = self.sync_file(id, None);
            results.push((id, result));
        }
        results
    }

    /// Number of deferred syncs waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn enqueue_sync(&mut self, id: FileId) {
        if !self.pending.contains(&id) {
            self.pending.push_back(id);
        }
    }

    pub(crate) fn add_to_open_set(&mut self, vault: Vault) -> EngineResult<FileId> {
        let id = vault.id();
        if self.open_files.iter().any(|f| f.id() == id) {
            return Err(EngineError::DuplicateFile { id });
        }
        self.open_files.push(vault);
        Ok(id)
    }

    pub(crate) fn save_registry(&self) {
        if let Some(path) = &self.config.registry_path {
            if let Err(e) = self.registry.save_to(path) {
                warn!(error = %e, "failed to persist file-info registry");
            }
        }
    }

    /// Starts a debounced watch for a local file, feeding syncs into the
    /// pending drain.
    pub(crate) fn start_watch(&mut self, id: FileId, storage: &str, path: &str) {
        if self.watchers.contains_key(&id) {
            return;
        }
        let backend = match self.backend(storage) {
            Ok(backend) if backend.supports_watch() => backend,
            _ => return,
        };

        let tx = self.watch_tx.clone();
        let debouncer = Debouncer::new(
            self.config.file_change_sync,
            Box::new(move || {
                let _ = tx.send(id);
            }),
        );
        let handle = debouncer.handle();
        if let Err(e) = backend.watch(path, Box::new(move || handle.notify())) {
            warn!(%id, path, error = %e, "failed to start file watch");
            return;
        }

        self.watchers.insert(
            id,
            FileWatch {
                storage: storage.to_string(),
                path: path.to_string(),
                debouncer,
            },
        );
        debug!(%id, path, "watching for file changes");
    }

    pub(crate) fn stop_watch(&mut self, id: &FileId) {
        if let Some(mut watch) = self.watchers.remove(id) {
            if let Ok(backend) = self.backend(&watch.storage) {
                let _ = backend.unwatch(&watch.path);
            }
            watch.debouncer.stop();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        let ids: Vec<FileId> = self.watchers.keys().copied().collect();
        for id in ids {
            self.stop_watch(&id);
        }
    }
}

/// Current time as epoch milliseconds.
#[must_use]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_storage::MemoryCache;

    fn app() -> App {
        App::new(EngineConfig::default(), Arc::new(MemoryCache::new())).unwrap()
    }

    #[test]
    fn create_new_file_enters_open_set_only() {
        let mut app = app();
        let id = app
            .create_new_file("personal", VaultKey::from_password("pw"))
            .unwrap();

        assert_eq!(app.file_count(), 1);
        assert!(app.file(&id).is_some());
        assert!(app.registry().is_empty());
    }

    #[test]
    fn demo_file_has_sample_entries() {
        let mut app = app();
        let id = app.create_demo_file().unwrap();

        let vault = app.file(&id).unwrap();
        assert!(vault.demo());
        assert_eq!(vault.entry_count(), 2);
    }

    #[test]
    fn demo_sync_is_noop() {
        let mut app = app();
        let id = app.create_demo_file().unwrap();
        app.sync_file(id, None).unwrap();
        assert!(app.registry().is_empty());
    }

    #[test]
    fn import_xml_returns_ok_on_success() {
        let mut app = app();
        let xml = r#"<Entry>
            <String><Key>Title</Key><Value>site</Value></String>
            <String><Key>Password</Key><Value>p</Value></String>
        </Entry>"#;

        let id = app
            .import_file_with_xml("imported", VaultKey::from_password("pw"), xml)
            .unwrap();
        assert_eq!(app.file(&id).unwrap().entry_count(), 1);
    }

    #[test]
    fn close_file_removes_from_open_set() {
        let mut app = app();
        let id = app
            .create_new_file("personal", VaultKey::from_password("pw"))
            .unwrap();

        app.close_file(&id).unwrap();
        assert_eq!(app.file_count(), 0);
        assert!(matches!(
            app.close_file(&id),
            Err(EngineError::FileNotOpen { .. })
        ));
    }

    #[test]
    fn clear_stored_key_files() {
        let mut app = app();
        let mut info = crate::registry::FileInfo::new(FileId::new(), "a");
        info.key_file_name = Some("key.bin".into());
        info.key_file_hash = Some("ff".repeat(32));
        app.registry.unshift(info);

        app.clear_stored_key_files();
        let info = app.registry().iter().next().unwrap();
        assert!(info.key_file_name.is_none());
        assert!(info.key_file_hash.is_none());
    }

    #[test]
    fn unknown_backend_rejected() {
        let app = app();
        assert!(matches!(
            app.backend("dropbox"),
            Err(EngineError::UnknownStorage { .. })
        ));
        assert!(app.backend("file").is_ok());
    }
}
