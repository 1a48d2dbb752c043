//! The runtime vault object driven by the sync engine.

use crate::error::{VaultError, VaultResult};
use crate::format;
use crate::id::FileId;
use crate::key::VaultKey;
use crate::xml::parse_xml_entries;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// One password entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Stable entry id.
    pub id: Uuid,
    /// Group the entry belongs to.
    pub group: String,
    /// Display title.
    pub title: String,
    /// Named fields (user name, password, URL, ...).
    pub fields: BTreeMap<String, String>,
    /// Last modification time, epoch milliseconds. Drives merge.
    pub updated_at: u64,
    /// Whether the entry sits in the trash.
    pub trashed: bool,
}

/// An open password database.
///
/// Two families of state live here: the decrypted entries, and the sync
/// bookkeeping the engine drives. The flags follow a strict discipline -
/// `modified` means local edits not yet on the backend, `dirty` means
/// local bytes not yet in the cache, and each clears only on a confirmed
/// write to its store. `syncing` flips to true in exactly one place,
/// [`set_sync_progress`](Vault::set_sync_progress).
pub struct Vault {
    id: FileId,
    salt: [u8; 16],
    key: VaultKey,
    entries: BTreeMap<Uuid, Entry>,

    name: String,
    path: Option<String>,
    storage: Option<String>,
    opts: BTreeMap<String, String>,
    cache_id: FileId,
    rev: Option<String>,
    edit_state: Option<Vec<u8>>,

    modified: bool,
    dirty: bool,
    syncing: bool,
    demo: bool,
    sync_date: Option<u64>,
    sync_error: Option<String>,
}

impl Vault {
    /// Creates a fresh empty vault with a new stable id.
    ///
    /// New vaults are `modified` and `dirty`: nothing has reached any
    /// store yet, and the first sync persists them.
    #[must_use]
    pub fn create(name: impl Into<String>, key: VaultKey) -> Self {
        Self::assemble(
            FileId::new(),
            rand::random(),
            key,
            BTreeMap::new(),
            name.into(),
            true,
        )
    }

    /// Opens a vault from container bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKey`] when the key does not match, or
    /// [`VaultError::Corrupted`] for structural failures.
    pub fn open(name: impl Into<String>, key: VaultKey, bytes: &[u8]) -> VaultResult<Self> {
        let container = format::unseal(&key, bytes)?;
        Ok(Self::assemble(
            container.id,
            container.salt,
            key,
            container.entries,
            name.into(),
            false,
        ))
    }

    /// Builds a vault from a cleartext XML export.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Xml`] when the export cannot be parsed.
    pub fn import_xml(
        name: impl Into<String>,
        key: VaultKey,
        xml: &str,
    ) -> VaultResult<Self> {
        let imported = parse_xml_entries(xml)?;
        let now = now_millis();
        let mut entries = BTreeMap::new();
        for (group, title, fields) in imported {
            let id = Uuid::new_v4();
            entries.insert(
                id,
                Entry {
                    id,
                    group,
                    title,
                    fields,
                    updated_at: now,
                    trashed: false,
                },
            );
        }
        Ok(Self::assemble(
            FileId::new(),
            rand::random(),
            key,
            entries,
            name.into(),
            true,
        ))
    }

    fn assemble(
        id: FileId,
        salt: [u8; 16],
        key: VaultKey,
        entries: BTreeMap<Uuid, Entry>,
        name: String,
        fresh: bool,
    ) -> Self {
        Self {
            id,
            salt,
            key,
            entries,
            name,
            path: None,
            storage: None,
            opts: BTreeMap::new(),
            cache_id: id,
            rev: None,
            edit_state: None,
            modified: fresh,
            dirty: fresh,
            syncing: false,
            demo: false,
            sync_date: None,
            sync_error: None,
        }
    }

    /// Serializes and encrypts the vault.
    pub fn get_data(&self) -> VaultResult<Vec<u8>> {
        format::seal(self.id, &self.salt, &self.key, &self.entries)
    }

    /// Reconciles remote container bytes into this vault.
    ///
    /// The remote container is opened with this vault's key, falling back
    /// to `remote_key` when supplied. Entries merge newest-wins by id;
    /// entries only present on one side are kept. Repeating the call with
    /// identical remote bytes changes nothing.
    ///
    /// A merge that changes the in-memory state marks the vault `dirty`
    /// so the merged bytes get re-cached.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKey`] when neither key opens the
    /// remote bytes.
    pub fn merge_or_update(
        &mut self,
        remote_bytes: &[u8],
        remote_key: Option<&VaultKey>,
    ) -> VaultResult<()> {
        let container = match format::unseal(&self.key, remote_bytes) {
            Ok(container) => container,
            Err(VaultError::InvalidKey) => match remote_key {
                Some(key) => format::unseal(key, remote_bytes)?,
                None => return Err(VaultError::InvalidKey),
            },
            Err(e) => return Err(e),
        };

        let mut changed = false;
        for (id, remote) in container.entries {
            match self.entries.get(&id) {
                Some(local) if local.updated_at >= remote.updated_at => {}
                _ => {
                    self.entries.insert(id, remote);
                    changed = true;
                }
            }
        }
        if changed {
            self.dirty = true;
        }
        Ok(())
    }

    /// Marks a sync as started. The only place `syncing` flips to true.
    pub fn set_sync_progress(&mut self) {
        self.syncing = true;
    }

    /// Records the terminal state of a sync attempt.
    ///
    /// Clears `syncing`; on success clears `modified` and advances the
    /// sync date; `saved_to_cache` clears `dirty`; path and storage adopt
    /// the effective values the sync ran against.
    pub fn set_sync_complete(
        &mut self,
        path: Option<&str>,
        storage: Option<&str>,
        err: Option<&str>,
        saved_to_cache: bool,
    ) {
        self.syncing = false;
        self.sync_error = err.map(str::to_string);
        if err.is_none() {
            self.modified = false;
            self.sync_date = Some(now_millis());
        }
        if saved_to_cache {
            self.dirty = false;
        }
        self.path = path.map(str::to_string);
        self.storage = storage.map(str::to_string);
    }

    /// Stores the opaque in-progress edit-state blob.
    pub fn set_local_edit_state(&mut self, blob: Option<Vec<u8>>) {
        self.edit_state = blob;
    }

    /// Returns the opaque edit-state blob.
    #[must_use]
    pub fn local_edit_state(&self) -> Option<&[u8]> {
        self.edit_state.as_deref()
    }

    /// Inserts or replaces an entry, stamping it as edited now.
    pub fn upsert_entry(
        &mut self,
        id: Option<Uuid>,
        group: impl Into<String>,
        title: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Uuid {
        let id = id.unwrap_or_else(Uuid::new_v4);
        self.entries.insert(
            id,
            Entry {
                id,
                group: group.into(),
                title: title.into(),
                fields,
                updated_at: now_millis(),
                trashed: false,
            },
        );
        self.mark_edited();
        id
    }

    /// Moves an entry to the trash. Returns false if the id is unknown.
    pub fn move_to_trash(&mut self, id: &Uuid) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.trashed = true;
                entry.updated_at = now_millis();
                self.mark_edited();
                true
            }
            None => false,
        }
    }

    /// Returns the trashed entries.
    pub fn trash_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(|e| e.trashed)
    }

    /// Permanently removes all trashed entries.
    pub fn empty_trash(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.trashed);
        if self.entries.len() != before {
            self.mark_edited();
        }
    }

    /// Releases the decrypted entries.
    pub fn close(&mut self) {
        self.entries.clear();
    }

    fn mark_edited(&mut self) {
        self.modified = true;
        self.dirty = true;
    }

    /// Marks unsynced local edits, used when restoring a file whose
    /// registry record says edits never reached the backend.
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    /// Marks the in-memory bytes as not yet cached.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Records a confirmed cache write.
    pub fn mark_cached(&mut self) {
        self.dirty = false;
    }

    /// Looks up an entry by id.
    #[must_use]
    pub fn entry(&self, id: &Uuid) -> Option<&Entry> {
        self.entries.get(id)
    }

    /// Iterates over all entries, trashed included.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Number of entries, trashed included.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Stable content-derived id.
    #[must_use]
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Cache key this vault is bound to.
    #[must_use]
    pub fn cache_id(&self) -> FileId {
        self.cache_id
    }

    /// Binds the cache key.
    pub fn set_cache_id(&mut self, id: FileId) {
        self.cache_id = id;
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend path, if backed by a storage provider.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Sets the backend path.
    pub fn set_path(&mut self, path: Option<String>) {
        self.path = path;
    }

    /// Backend tag, or `None` for a local-only file.
    #[must_use]
    pub fn storage(&self) -> Option<&str> {
        self.storage.as_deref()
    }

    /// Sets the backend tag.
    pub fn set_storage(&mut self, storage: Option<String>) {
        self.storage = storage;
    }

    /// Backend-specific options.
    #[must_use]
    pub fn opts(&self) -> &BTreeMap<String, String> {
        &self.opts
    }

    /// Replaces the backend-specific options.
    pub fn set_opts(&mut self, opts: BTreeMap<String, String>) {
        self.opts = opts;
    }

    /// Last-known backend revision.
    #[must_use]
    pub fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    /// Updates the backend revision mirror.
    pub fn set_rev(&mut self, rev: Option<String>) {
        self.rev = rev;
    }

    /// True when local edits have never reached the backend.
    #[must_use]
    pub fn modified(&self) -> bool {
        self.modified
    }

    /// True when local bytes have never reached the cache.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// True while a sync cycle runs. Acts as the per-file mutex.
    #[must_use]
    pub fn syncing(&self) -> bool {
        self.syncing
    }

    /// True for throwaway demo files; sync is a no-op for them.
    #[must_use]
    pub fn demo(&self) -> bool {
        self.demo
    }

    /// Marks this vault as a demo file.
    pub fn set_demo(&mut self, demo: bool) {
        self.demo = demo;
    }

    /// Time of the last successful sync, epoch milliseconds.
    #[must_use]
    pub fn sync_date(&self) -> Option<u64> {
        self.sync_date
    }

    /// Advances the sync timestamp to now.
    pub fn touch_sync_date(&mut self) {
        self.sync_date = Some(now_millis());
    }

    /// Error message from the last sync attempt, if it failed.
    #[must_use]
    pub fn sync_error(&self) -> Option<&str> {
        self.sync_error.as_deref()
    }

    /// Key-file hash of this vault's key, if a key file is in use.
    #[must_use]
    pub fn key_file_hash(&self) -> Option<&[u8; crate::key::KEY_FILE_HASH_SIZE]> {
        self.key.key_file_hash()
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("storage", &self.storage)
            .field("entries", &self.entries.len())
            .field("modified", &self.modified)
            .field("dirty", &self.dirty)
            .field("syncing", &self.syncing)
            .finish()
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

    fn key() -> VaultKey {
        VaultKey::from_password("pw")
    }

    fn fields(user: &str) -> BTreeMap<String, String> {
        let mut f = BTreeMap::new();
        f.insert("UserName".to_string(), user.to_string());
        f
    }

    #[test]
    fn create_open_roundtrip() {
        let mut vault = Vault::create("personal", key());
        vault.upsert_entry(None, "Web", "example.com", fields("alice"));
        let bytes = vault.get_data().unwrap();

        let reopened = Vault::open("personal", key(), &bytes).unwrap();
        assert_eq!(reopened.id(), vault.id());
        assert_eq!(reopened.entry_count(), 1);
        assert!(!reopened.modified());
        assert!(!reopened.dirty());
    }

    #[test]
    fn id_stable_across_serializations() {
        let mut vault = Vault::create("personal", key());
        let id = vault.id();
        let b1 = vault.get_data().unwrap();
        vault.upsert_entry(None, "Web", "a", fields("u"));
        let b2 = vault.get_data().unwrap();

        assert_eq!(Vault::open("p", key(), &b1).unwrap().id(), id);
        assert_eq!(Vault::open("p", key(), &b2).unwrap().id(), id);
    }

    #[test]
    fn edits_set_modified_and_dirty() {
        let bytes = Vault::create("v", key()).get_data().unwrap();
        let mut vault = Vault::open("v", key(), &bytes).unwrap();
        assert!(!vault.modified());

        vault.upsert_entry(None, "Web", "site", fields("u"));
        assert!(vault.modified());
        assert!(vault.dirty());
    }

    #[test]
    fn sync_complete_clears_flags() {
        let mut vault = Vault::create("v", key());
        vault.upsert_entry(None, "Web", "site", fields("u"));
        vault.set_sync_progress();
        assert!(vault.syncing());

        vault.set_sync_complete(Some("/v.lsdb"), Some("memory"), None, true);
        assert!(!vault.syncing());
        assert!(!vault.modified());
        assert!(!vault.dirty());
        assert!(vault.sync_date().is_some());
        assert_eq!(vault.path(), Some("/v.lsdb"));
        assert_eq!(vault.storage(), Some("memory"));
    }

    #[test]
    fn sync_complete_with_error_keeps_modified() {
        let mut vault = Vault::create("v", key());
        vault.upsert_entry(None, "Web", "site", fields("u"));
        vault.set_sync_progress();

        vault.set_sync_complete(None, Some("memory"), Some("offline"), true);
        assert!(!vault.syncing());
        assert!(vault.modified());
        assert!(!vault.dirty());
        assert_eq!(vault.sync_error(), Some("offline"));
    }

    #[test]
    fn merge_takes_newer_remote_entry() {
        let mut local = Vault::create("v", key());
        let id = local.upsert_entry(None, "Web", "site", fields("old"));

        let mut remote = Vault::open("v", key(), &local.get_data().unwrap()).unwrap();
        // Make the remote edit strictly newer.
        let newer = local.entry(&id).unwrap().updated_at + 10;
        remote.upsert_entry(Some(id), "Web", "site", fields("new"));
        remote.entries.get_mut(&id).unwrap().updated_at = newer;
        let remote_bytes = remote.get_data().unwrap();

        local.merge_or_update(&remote_bytes, None).unwrap();
        assert_eq!(local.entry(&id).unwrap().fields["UserName"], "new");
        assert!(local.dirty());
    }

    #[test]
    fn merge_keeps_newer_local_entry() {
        let mut base = Vault::create("v", key());
        base.upsert_entry(None, "Web", "site", fields("u"));
        let remote_bytes = base.get_data().unwrap();

        let mut local = Vault::open("v", key(), &remote_bytes).unwrap();
        let local_id = local.upsert_entry(None, "Web", "local-only", fields("me"));

        local.merge_or_update(&remote_bytes, None).unwrap();
        assert!(local.entry(&local_id).is_some());
        assert_eq!(local.entry_count(), 2);
    }

    #[test]
    fn merge_identical_bytes_is_idempotent() {
        let mut vault = Vault::create("v", key());
        vault.upsert_entry(None, "Web", "site", fields("u"));
        let bytes = vault.get_data().unwrap();

        let mut opened = Vault::open("v", key(), &bytes).unwrap();
        opened.merge_or_update(&bytes, None).unwrap();
        assert!(!opened.dirty());
        opened.merge_or_update(&bytes, None).unwrap();
        assert_eq!(opened.entry_count(), 1);
        assert!(!opened.dirty());
    }

    #[test]
    fn merge_with_remote_key() {
        let other_key = VaultKey::from_password("other");
        let mut remote = Vault::create("v", other_key.clone());
        remote.upsert_entry(None, "Web", "site", fields("u"));
        let remote_bytes = remote.get_data().unwrap();

        let mut local = Vault::create("v", key());
        let err = local.merge_or_update(&remote_bytes, None).unwrap_err();
        assert!(err.is_invalid_key());

        local.merge_or_update(&remote_bytes, Some(&other_key)).unwrap();
        assert_eq!(local.entry_count(), 1);
    }

    #[test]
    fn trash_lifecycle() {
        let mut vault = Vault::create("v", key());
        let id = vault.upsert_entry(None, "Web", "site", fields("u"));

        assert!(vault.move_to_trash(&id));
        assert_eq!(vault.trash_entries().count(), 1);

        vault.empty_trash();
        assert_eq!(vault.entry_count(), 0);
        assert!(!vault.move_to_trash(&id));
    }

    #[test]
    fn edit_state_passthrough() {
        let mut vault = Vault::create("v", key());
        assert!(vault.local_edit_state().is_none());
        vault.set_local_edit_state(Some(vec![1, 2, 3]));
        assert_eq!(vault.local_edit_state(), Some(&[1u8, 2, 3][..]));
    }
}
