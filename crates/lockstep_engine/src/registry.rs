//! Persistent registry of recently opened files.

use crate::error::{EngineError, EngineResult};
use lockstep_storage::{Rev, StorageOpts};
use lockstep_vault::FileId;
use std::path::Path;

/// Magic bytes for the registry file.
pub const REGISTRY_MAGIC: [u8; 4] = *b"LSFI";

/// Current registry format version.
pub const REGISTRY_VERSION: u16 = 1;

/// Persisted metadata for one previously opened file.
///
/// The `id` is unique across the registry and doubles as the cache key
/// for the file's serialized bytes. `modified = true` implies a cache
/// entry exists under `id` - the open and sync paths maintain that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Stable registry id; also the cache key.
    pub id: FileId,
    /// Display name.
    pub name: String,
    /// Backend tag, or `None` for a local-only file.
    pub storage: Option<String>,
    /// Backend path.
    pub path: Option<String>,
    /// Backend-specific opts, in persisted form.
    pub opts: StorageOpts,
    /// Last-known backend revision.
    pub rev: Option<Rev>,
    /// Local edits exist that never reached the backend.
    pub modified: bool,
    /// Opaque in-progress edit-state blob.
    pub edit_state: Option<Vec<u8>>,
    /// Last successful sync, epoch milliseconds.
    pub sync_date: Option<u64>,
    /// Last open, epoch milliseconds.
    pub open_date: Option<u64>,
    /// Key-file name hint, stored only when remembering key files.
    pub key_file_name: Option<String>,
    /// Key-file hash hint (hex), stored only when remembering key files.
    pub key_file_hash: Option<String>,
}

impl FileInfo {
    /// Creates a minimal record for a file known only by id and name.
    #[must_use]
    pub fn new(id: FileId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            storage: None,
            path: None,
            opts: StorageOpts::new(),
            rev: None,
            modified: false,
            edit_state: None,
            sync_date: None,
            open_date: None,
            key_file_name: None,
            key_file_hash: None,
        }
    }
}

/// Ordered most-recently-used list of [`FileInfo`] records.
///
/// The head is the most recently opened or synced file. Inserting an
/// existing id moves it to the head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfoRegistry {
    infos: Vec<FileInfo>,
}

impl FileInfoRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a record by id.
    #[must_use]
    pub fn get(&self, id: &FileId) -> Option<&FileInfo> {
        self.infos.iter().find(|i| i.id == *id)
    }

    /// Looks up a record by id, mutably.
    pub fn get_mut(&mut self, id: &FileId) -> Option<&mut FileInfo> {
        self.infos.iter_mut().find(|i| i.id == *id)
    }

    /// Looks up a record matching the full storage/name/path triple.
    ///
    /// Used when an open request carries no id.
    #[must_use]
    pub fn get_match(
        &self,
        storage: Option<&str>,
        name: &str,
        path: Option<&str>,
    ) -> Option<&FileInfo> {
        self.infos.iter().find(|i| {
            i.storage.as_deref() == storage && i.name == name && i.path.as_deref() == path
        })
    }

    /// Looks up the first record with the given name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&FileInfo> {
        self.infos.iter().find(|i| i.name == name)
    }

    /// Removes and returns the record with the given id.
    pub fn remove(&mut self, id: &FileId) -> Option<FileInfo> {
        let pos = self.infos.iter().position(|i| i.id == *id)?;
        Some(self.infos.remove(pos))
    }

    /// Inserts a record at the head, replacing any entry with the same id.
    pub fn unshift(&mut self, info: FileInfo) {
        self.infos.retain(|i| i.id != info.id);
        self.infos.insert(0, info);
    }

    /// Iterates records in MRU order.
    pub fn iter(&self) -> impl Iterator<Item = &FileInfo> {
        self.infos.iter()
    }

    /// Iterates records mutably, preserving order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileInfo> {
        self.infos.iter_mut()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// True when the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Encodes the whole list to bytes (deterministic).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&REGISTRY_MAGIC);
        buf.extend_from_slice(&REGISTRY_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.infos.len() as u32).to_le_bytes());

        for info in &self.infos {
            buf.extend_from_slice(info.id.as_bytes());
            put_str(&mut buf, &info.name);
            put_opt_str(&mut buf, info.storage.as_deref());
            put_opt_str(&mut buf, info.path.as_deref());

            buf.extend_from_slice(&(info.opts.len() as u32).to_le_bytes());
            for (k, v) in &info.opts {
                put_str(&mut buf, k);
                put_str(&mut buf, v);
            }

            put_opt_str(&mut buf, info.rev.as_ref().map(Rev::as_str));
            buf.push(u8::from(info.modified));
            put_opt_bytes(&mut buf, info.edit_state.as_deref());
            put_opt_u64(&mut buf, info.sync_date);
            put_opt_u64(&mut buf, info.open_date);
            put_opt_str(&mut buf, info.key_file_name.as_deref());
            put_opt_str(&mut buf, info.key_file_hash.as_deref());
        }

        buf
    }

    /// Decodes a registry from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on bad magic, a future version, or truncation.
    pub fn decode(data: &[u8]) -> EngineResult<Self> {
        let mut r = Reader::new(data);

        let magic = r.take(4)?;
        if magic != REGISTRY_MAGIC {
            return Err(EngineError::registry("invalid registry magic"));
        }
        let version = r.u16()?;
        if version > REGISTRY_VERSION {
            return Err(EngineError::registry(format!(
                "unsupported registry version: {version}"
            )));
        }

        let count = r.u32()? as usize;
        let mut infos = Vec::with_capacity(count);
        for _ in 0..count {
            let id = FileId::from_slice(r.take(16)?)
                .ok_or_else(|| EngineError::registry("invalid file id"))?;
            let name = r.str()?;
            let storage = r.opt_str()?;
            let path = r.opt_str()?;

            let opt_count = r.u32()? as usize;
            let mut opts = StorageOpts::new();
            for _ in 0..opt_count {
                let k = r.str()?;
                let v = r.str()?;
                opts.insert(k, v);
            }

            let rev = r.opt_str()?.map(Rev::new);
            let modified = r.u8()? != 0;
            let edit_state = r.opt_bytes()?;
            let sync_date = r.opt_u64()?;
            let open_date = r.opt_u64()?;
            let key_file_name = r.opt_str()?;
            let key_file_hash = r.opt_str()?;

            infos.push(FileInfo {
                id,
                name,
                storage,
                path,
                opts,
                rev,
                modified,
                edit_state,
                sync_date,
                open_date,
                key_file_name,
                key_file_hash,
            });
        }

        Ok(Self { infos })
    }

    /// Loads a registry from disk. A missing file loads as empty.
    ///
    /// # Errors
    ///
    /// Returns an error on unreadable or undecodable contents.
    pub fn load_from(path: &Path) -> EngineResult<Self> {
        match std::fs::read(path) {
            Ok(data) => Self::decode(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(EngineError::registry(format!("read failed: {e}"))),
        }
    }

    /// Persists the registry to disk.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::registry(format!("mkdir failed: {e}")))?;
            }
        }
        std::fs::write(path, self.encode())
            .map_err(|e| EngineError::registry(format!("write failed: {e}")))
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.push(1);
            put_str(buf, s);
        }
        None => buf.push(0),
    }
}

fn put_opt_bytes(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            buf.push(1);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        None => buf.push(0),
    }
}

fn put_opt_u64(buf: &mut Vec<u8>, value: Option<u64>) {
    match value {
        Some(value) => {
            buf.push(1);
            buf.extend_from_slice(&value.to_le_bytes());
        }
        None => buf.push(0),
    }
}

/// Cursor over encoded registry bytes with bounds-checked reads.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(EngineError::registry("registry too short"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> EngineResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> EngineResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> EngineResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> EngineResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn str(&mut self) -> EngineResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EngineError::registry("invalid utf-8 string"))
    }

    fn opt_str(&mut self) -> EngineResult<Option<String>> {
        if self.u8()? == 0 {
            return Ok(None);
        }
        Ok(Some(self.str()?))
    }

    fn opt_bytes(&mut self) -> EngineResult<Option<Vec<u8>>> {
        if self.u8()? == 0 {
            return Ok(None);
        }
        let len = self.u32()? as usize;
        Ok(Some(self.take(len)?.to_vec()))
    }

    fn opt_u64(&mut self) -> EngineResult<Option<u64>> {
        if self.u8()? == 0 {
            return Ok(None);
        }
        Ok(Some(self.u64()?))
    }
}
