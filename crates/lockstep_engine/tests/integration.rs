//! Integration tests for the open orchestrator and sync state machine.

use lockstep_engine::{
    App, EngineConfig, EngineError, EngineEvent, KeyFileSource, OpenRequest, SyncOptions,
};
use lockstep_storage::{Cache, MemoryCache, MemoryStorage, StorageBackend, StorageOpts};
use lockstep_vault::{Vault, VaultKey};
use std::collections::BTreeMap;
use std::sync::Arc;

const PATH: &str = "/personal.lsdb";

struct Fixture {
    app: App,
    storage: Arc<MemoryStorage>,
    cache: Arc<MemoryCache>,
}

fn fixture() -> Fixture {
    fixture_with_config(EngineConfig::default())
}

fn fixture_with_config(config: EngineConfig) -> Fixture {
    let cache = Arc::new(MemoryCache::new());
    let storage = Arc::new(MemoryStorage::new("memory"));
    let mut app = App::new(config, cache.clone()).unwrap();
    app.register_storage(storage.clone());
    Fixture {
        app,
        storage,
        cache,
    }
}

fn key() -> VaultKey {
    VaultKey::from_password("pw")
}

fn fields(user: &str) -> BTreeMap<String, String> {
    let mut f = BTreeMap::new();
    f.insert("UserName".to_string(), user.to_string());
    f
}

/// Writes a fresh vault to the remote backend and returns its bytes.
fn seed_remote(storage: &MemoryStorage) -> Vec<u8> {
    let mut vault = Vault::create("personal", key());
    vault.upsert_entry(None, "Web", "seed", fields("alice"));
    let bytes = vault.get_data().unwrap();
    storage.put_remote(PATH, bytes.clone());
    bytes
}

fn open_request() -> OpenRequest {
    OpenRequest::new("personal", "pw")
        .with_storage("memory")
        .with_path(PATH)
}

#[test]
fn s1_clean_sync_does_no_io_beyond_stat() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    assert_eq!(f.storage.load_count(), 1);

    f.app.sync_file(id, None).unwrap();

    assert_eq!(f.storage.stat_count(), 1);
    assert_eq!(f.storage.load_count(), 1, "no reload on clean sync");
    assert_eq!(f.storage.save_count(), 0, "no save on clean sync");

    let vault = f.app.file(&id).unwrap();
    assert!(!vault.modified());
    assert!(!vault.syncing());

    let info = f.app.registry().get_by_name("personal").unwrap();
    assert!(info.sync_date.is_some());
    assert!(!info.modified);
}

#[test]
fn s2_edit_then_sync_pushes_and_advances_rev() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    let rev_before = f
        .app
        .registry()
        .get_by_name("personal")
        .unwrap()
        .rev
        .clone()
        .unwrap();

    f.app
        .file_mut(&id)
        .unwrap()
        .upsert_entry(None, "Web", "new-site", fields("bob"));
    assert!(f.app.file(&id).unwrap().modified());

    f.app.sync_file(id, None).unwrap();

    let vault = f.app.file(&id).unwrap();
    assert!(!vault.modified());
    assert!(!vault.dirty());

    let info = f.app.registry().get_by_name("personal").unwrap();
    let rev_after = info.rev.clone().unwrap();
    assert_ne!(rev_before, rev_after);
    // The terminal save's rev is what the backend now reports.
    let stat = f.storage.stat(PATH, &StorageOpts::new()).unwrap();
    assert_eq!(stat.rev.unwrap(), rev_after);
    assert_eq!(f.storage.save_count(), 1);
}

#[test]
fn s3_remote_newer_merges_without_save() {
    let mut f = fixture();
    let seed_bytes = seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();

    // Another client adds an entry and bumps the revision.
    let mut remote = Vault::open("personal", key(), &seed_bytes).unwrap();
    remote.upsert_entry(None, "Web", "added-remotely", fields("carol"));
    let new_rev = f.storage.put_remote(PATH, remote.get_data().unwrap());

    let events = f.app.subscribe();
    f.app.sync_file(id, None).unwrap();

    let vault = f.app.file(&id).unwrap();
    assert_eq!(vault.entry_count(), 2);
    assert!(!vault.dirty());
    assert!(vault.sync_date().is_some());
    assert_eq!(f.storage.save_count(), 0, "merge without local edits never saves");

    let info = f.app.registry().get_by_name("personal").unwrap();
    assert_eq!(info.rev.clone().unwrap(), new_rev);

    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::Refresh { file_id: id }
    );
}

#[test]
fn s4_rev_conflict_on_save_retries_and_succeeds() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    f.app
        .file_mut(&id)
        .unwrap()
        .upsert_entry(None, "Web", "edited", fields("bob"));

    let loads_before = f.storage.load_count();
    f.storage.set_conflict_next_save();

    f.app.sync_file(id, None).unwrap();

    // One conflicted save, one merge reload, one successful save.
    assert_eq!(f.storage.save_count(), 2);
    assert_eq!(f.storage.load_count(), loads_before + 1);

    let vault = f.app.file(&id).unwrap();
    assert!(!vault.modified());
    assert!(!vault.dirty());
}

#[test]
fn s5_invalid_key_on_merge_emits_event_and_keeps_file() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();

    // The remote copy gets re-encrypted under a different key.
    let rekeyed = VaultKey::from_password("new-password");
    let mut remote = Vault::create("personal", rekeyed.clone());
    remote.upsert_entry(None, "Web", "rekeyed-entry", fields("dave"));
    f.storage.put_remote(PATH, remote.get_data().unwrap());

    let events = f.app.subscribe();
    let err = f.app.sync_file(id, None).unwrap_err();
    assert!(err.is_invalid_key());
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::RemoteKeyChanged { file_id: id }
    );

    let vault = f.app.file(&id).unwrap();
    assert_eq!(vault.entry_count(), 1, "local entries unchanged");
    assert!(!vault.syncing(), "sync completed despite the error");

    // Supplying the remote key lets the merge through.
    let options = SyncOptions::new().with_remote_key(rekeyed);
    f.app.sync_file(id, Some(options)).unwrap();
    assert_eq!(f.app.file(&id).unwrap().entry_count(), 2);
}

#[test]
fn s6_offline_open_falls_back_to_cache() {
    let mut f = fixture();
    seed_remote(&f.storage);

    // First session populates cache and registry.
    let id = f.app.open_file(open_request()).unwrap();
    f.app.close_file(&id).unwrap();

    // Backend goes dark.
    f.storage.set_fail_load(true);
    f.storage.set_fail_stat(true);

    let id = f.app.open_file(open_request()).unwrap();
    let vault = f.app.file(&id).unwrap();
    assert_eq!(vault.entry_count(), 1);

    // The deferred reconciliation runs and reports the backend failure,
    // but the open itself already succeeded.
    let results = f.app.process_pending();
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_err());
    assert!(f.app.file(&id).is_some());
}

#[test]
fn duplicate_open_is_rejected() {
    let mut f = fixture();
    let bytes = seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();

    // The same database under a different path decrypts to the same id.
    f.storage.put_remote("/copy.lsdb", bytes);
    let err = f
        .app
        .open_file(
            OpenRequest::new("copy", "pw")
                .with_storage("memory")
                .with_path("/copy.lsdb"),
        )
        .unwrap_err();

    assert!(matches!(err, EngineError::DuplicateFile { id: dup } if dup == id));
    assert_eq!(f.app.file_count(), 1);
}

#[test]
fn always_conflicting_save_terminates_after_three_merges() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    f.app
        .file_mut(&id)
        .unwrap()
        .upsert_entry(None, "Web", "edited", fields("bob"));

    let loads_before = f.storage.load_count();
    f.storage.set_always_conflict_on_save(true);

    let err = f.app.sync_file(id, None).unwrap_err();
    assert!(matches!(err, EngineError::TooManyLoadAttempts));
    assert_eq!(f.storage.load_count(), loads_before + 3);

    let vault = f.app.file(&id).unwrap();
    assert!(vault.modified(), "edits survive the failed sync");
    assert!(!vault.syncing());
}

#[test]
fn local_noop_sync_does_zero_io() {
    let mut f = fixture();
    let id = f.app.create_new_file("scratch", key()).unwrap();

    // First sync persists the new file to the cache.
    f.app.sync_file(id, None).unwrap();
    assert_eq!(f.cache.save_count(), 1);
    assert!(!f.app.file(&id).unwrap().modified());

    // Second sync has nothing to do.
    f.app.sync_file(id, None).unwrap();
    assert_eq!(f.cache.save_count(), 1);
    assert_eq!(f.cache.load_count(), 0);
    assert_eq!(f.storage.stat_count(), 0);
}

#[test]
fn sync_in_progress_is_rejected() {
    let mut f = fixture();
    let id = f.app.create_new_file("scratch", key()).unwrap();

    f.app.file_mut(&id).unwrap().set_sync_progress();
    let err = f.app.sync_file(id, None).unwrap_err();
    assert!(err.is_sync_in_progress());
}

#[test]
fn save_as_to_backend_creates_remote_copy() {
    let mut f = fixture();
    let id = f.app.create_new_file("fresh", key()).unwrap();
    f.app
        .file_mut(&id)
        .unwrap()
        .upsert_entry(None, "Web", "site", fields("eve"));

    let options = SyncOptions::new().with_storage("memory");
    f.app.sync_file(id, Some(options)).unwrap();

    // Path came from the backend's name convention.
    let stored = f.storage.raw("/fresh.lsdb").expect("remote copy exists");
    let remote = Vault::open("fresh", key(), &stored).unwrap();
    assert_eq!(remote.entry_count(), 1);

    let vault = f.app.file(&id).unwrap();
    assert_eq!(vault.storage(), Some("memory"));
    assert_eq!(vault.path(), Some("/fresh.lsdb"));
    assert!(!vault.modified());

    let info = f.app.registry().get_by_name("fresh").unwrap();
    assert_eq!(info.storage.as_deref(), Some("memory"));
    assert!(info.rev.is_some());
}

#[test]
fn switching_backends_recomputes_path_from_name() {
    let mut f = fixture();
    let backup = Arc::new(MemoryStorage::new("backup"));
    f.app.register_storage(backup.clone());

    // Seed the original backend at a path that does NOT follow the
    // name convention, so a stale-path reuse would be visible.
    let mut vault = Vault::create("personal", key());
    vault.upsert_entry(None, "Web", "seed", fields("alice"));
    f.storage.put_remote("/vaults/personal.lsdb", vault.get_data().unwrap());

    let id = f
        .app
        .open_file(
            OpenRequest::new("personal", "pw")
                .with_storage("memory")
                .with_path("/vaults/personal.lsdb"),
        )
        .unwrap();
    f.app
        .file_mut(&id)
        .unwrap()
        .upsert_entry(None, "Web", "edited", fields("bob"));

    // "Save as" onto the other backend with no path override: the old
    // backend's path must not be reused.
    let options = SyncOptions::new().with_storage("backup");
    f.app.sync_file(id, Some(options)).unwrap();

    assert!(
        backup.raw("/personal.lsdb").is_some(),
        "copy lands at the backup backend's conventional path"
    );
    assert!(backup.raw("/vaults/personal.lsdb").is_none());

    let stored = backup.raw("/personal.lsdb").unwrap();
    assert_eq!(Vault::open("personal", key(), &stored).unwrap().entry_count(), 2);

    let vault = f.app.file(&id).unwrap();
    assert_eq!(vault.storage(), Some("backup"));
    assert_eq!(vault.path(), Some("/personal.lsdb"));
    assert!(!vault.modified());

    // The original backend's copy is untouched.
    assert!(f.storage.raw("/vaults/personal.lsdb").is_some());
}

#[test]
fn offline_edits_survive_close_and_reopen() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    f.app
        .file_mut(&id)
        .unwrap()
        .upsert_entry(None, "Web", "offline-edit", fields("bob"));

    // Sync while the backend is unreachable: edits land in the cache,
    // the error surfaces, and the registry remembers the modified state.
    f.storage.set_fail_stat(true);
    assert!(f.app.sync_file(id, None).is_err());
    let info = f.app.registry().get_by_name("personal").unwrap();
    assert!(info.modified);

    f.app.close_file(&id).unwrap();

    // Reopen while still offline: the modified cache copy wins.
    let id = f.app.open_file(open_request()).unwrap();
    let vault = f.app.file(&id).unwrap();
    assert_eq!(vault.entry_count(), 2);
    assert!(vault.modified());
    assert_eq!(f.app.pending_count(), 1, "reconciliation queued");

    // Backend comes back; the queued sync pushes the edits.
    f.storage.set_fail_stat(false);
    let results = f.app.process_pending();
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());
    assert!(!f.app.file(&id).unwrap().modified());

    let stored = f.storage.raw(PATH).unwrap();
    let remote = Vault::open("personal", key(), &stored).unwrap();
    assert_eq!(remote.entry_count(), 2);
}

#[test]
fn fresh_cached_rev_skips_backend() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    let rev = f
        .app
        .registry()
        .get_by_name("personal")
        .unwrap()
        .rev
        .clone()
        .unwrap();
    f.app.close_file(&id).unwrap();

    let loads = f.storage.load_count();
    let stats = f.storage.stat_count();

    let id = f.app.open_file(open_request().with_rev(rev)).unwrap();
    assert!(f.app.file(&id).is_some());
    assert_eq!(f.storage.load_count(), loads, "no backend load");
    assert_eq!(f.storage.stat_count(), stats, "no backend stat");
    assert_eq!(f.app.pending_count(), 0, "no reconciliation queued");
}

#[test]
fn supplied_bytes_open_updates_cache() {
    let mut f = fixture();
    let mut vault = Vault::create("supplied", key());
    vault.upsert_entry(None, "Web", "site", fields("mallory"));
    let bytes = vault.get_data().unwrap();

    let id = f
        .app
        .open_file(OpenRequest::new("supplied", "pw").with_file_data(bytes))
        .unwrap();

    let info = f.app.registry().get_by_name("supplied").unwrap();
    assert!(f.cache.contains(&info.id.to_string()));
    assert_eq!(f.app.file(&id).unwrap().entry_count(), 1);
}

#[test]
fn local_only_open_without_info_fails() {
    let mut f = fixture();
    let err = f
        .app
        .open_file(OpenRequest::new("unknown", "pw"))
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSource { .. }));
}

#[test]
fn wrong_password_is_invalid_key() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let err = f
        .app
        .open_file(
            OpenRequest::new("personal", "wrong")
                .with_storage("memory")
                .with_path(PATH),
        )
        .unwrap_err();
    assert!(err.is_invalid_key());
    assert_eq!(f.app.file_count(), 0);
}

#[test]
fn remembered_key_file_reopens_without_the_file() {
    let config = EngineConfig::default().with_remember_key_files(true);
    let mut f = fixture_with_config(config);

    // Seed a remote vault locked with password + key file.
    let key_file = b"key file material".to_vec();
    let locked = VaultKey::new("pw", &key_file);
    let mut vault = Vault::create("personal", locked);
    vault.upsert_entry(None, "Web", "seed", fields("alice"));
    f.storage.put_remote(PATH, vault.get_data().unwrap());

    let id = f
        .app
        .open_file(open_request().with_key_file(KeyFileSource::Bytes {
            name: "key.bin".to_string(),
            data: key_file,
        }))
        .unwrap();

    let info = f.app.registry().get_by_name("personal").unwrap();
    assert!(info.key_file_hash.is_some());
    assert_eq!(info.key_file_name.as_deref(), Some("key.bin"));

    // Reopen with only the password; the remembered hash fills in.
    f.app.close_file(&id).unwrap();
    let id = f.app.open_file(open_request()).unwrap();
    assert_eq!(f.app.file(&id).unwrap().entry_count(), 1);
}

#[test]
fn remove_file_info_drops_registry_and_cache() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    let info_id = f.app.registry().get_by_name("personal").unwrap().id;
    f.app.close_file(&id).unwrap();
    assert!(f.cache.contains(&info_id.to_string()));

    f.app.remove_file_info(&info_id).unwrap();
    assert!(f.app.registry().is_empty());
    assert!(!f.cache.contains(&info_id.to_string()));
}

#[test]
fn registry_persists_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("files.lsfi");
    let cache = Arc::new(MemoryCache::new());
    let storage = Arc::new(MemoryStorage::new("memory"));

    {
        let config = EngineConfig::default().with_registry_path(&registry_path);
        let mut app = App::new(config, cache.clone()).unwrap();
        app.register_storage(storage.clone());
        seed_remote(&storage);
        app.open_file(open_request()).unwrap();
    }

    let config = EngineConfig::default().with_registry_path(&registry_path);
    let app = App::new(config, cache).unwrap();
    let info = app.registry().get_by_name("personal").unwrap();
    assert_eq!(info.storage.as_deref(), Some("memory"));
    assert_eq!(info.path.as_deref(), Some(PATH));
    assert!(info.rev.is_some());
}

#[test]
fn closed_file_is_skipped_by_pending_drain() {
    let mut f = fixture();
    seed_remote(&f.storage);

    let id = f.app.open_file(open_request()).unwrap();
    f.app
        .file_mut(&id)
        .unwrap()
        .upsert_entry(None, "Web", "x", fields("y"));
    f.storage.set_fail_stat(true);
    let _ = f.app.sync_file(id, None);
    f.app.close_file(&id).unwrap();
    f.storage.set_fail_stat(false);

    // Reopening queues a sync; closing before the drain must skip it.
    let id = f.app.open_file(open_request()).unwrap();
    f.app.close_file(&id).unwrap();
    assert!(f.app.process_pending().is_empty());
}

mod file_watch {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_of_changes_triggers_one_sync() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("watched.lsdb");
        let file_path_str = file_path.to_str().unwrap().to_string();

        // Seed a vault on disk.
        let mut vault = Vault::create("watched", key());
        vault.upsert_entry(None, "Web", "seed", fields("alice"));
        std::fs::write(&file_path, vault.get_data().unwrap()).unwrap();

        let config = EngineConfig::default().with_file_change_sync(Duration::from_millis(100));
        let cache = Arc::new(MemoryCache::new());
        let mut app = App::new(config, cache).unwrap();

        let id = app
            .open_file(
                OpenRequest::new("watched", "pw")
                    .with_storage("file")
                    .with_path(&file_path_str),
            )
            .unwrap();

        // Another process rewrites the file several times in a burst.
        let mut other = Vault::open("watched", key(), &std::fs::read(&file_path).unwrap()).unwrap();
        other.upsert_entry(None, "Web", "external-edit", fields("bob"));
        let edited = other.get_data().unwrap();
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            std::fs::write(&file_path, &edited).unwrap();
        }

        // Wait past the watcher poll and the debounce window.
        std::thread::sleep(Duration::from_millis(900));

        let results = app.process_pending();
        assert_eq!(results.len(), 1, "burst coalesced into one sync");
        assert!(results[0].1.is_ok());
        assert_eq!(app.file(&id).unwrap().entry_count(), 2);

        app.close_file(&id).unwrap();
    }
}
