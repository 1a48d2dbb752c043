//! Encrypted container codec.
//!
//! Physical layout:
//!
//! ```text
//! [Magic "LSVT" (4)][Version (2)][Vault id (16)][Salt (16)][Nonce (12)][Ciphertext]
//! ```
//!
//! The ciphertext is AES-256-GCM over the serialized entry list, keyed by
//! the derivation of the master key with the header salt. The vault id and
//! salt are fixed at creation and survive every re-serialization; the
//! nonce is fresh per seal.

use crate::error::{VaultError, VaultResult};
use crate::id::FileId;
use crate::key::VaultKey;
use crate::vault::Entry;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Magic bytes identifying a Lockstep vault container.
const MAGIC: [u8; 4] = *b"LSVT";
/// Current container format version.
const FORMAT_VERSION: u16 = 1;
/// Header length: magic + version + id + salt + nonce.
const HEADER_SIZE: usize = 4 + 2 + 16 + 16 + 12;

/// A decrypted container.
#[derive(Debug)]
pub(crate) struct Container {
    /// Stable vault id from the header.
    pub id: FileId,
    /// KDF salt from the header.
    pub salt: [u8; 16],
    /// Decrypted entries.
    pub entries: BTreeMap<Uuid, Entry>,
}

/// Seals entries into container bytes with a fresh nonce.
pub(crate) fn seal(
    id: FileId,
    salt: &[u8; 16],
    key: &VaultKey,
    entries: &BTreeMap<Uuid, Entry>,
) -> VaultResult<Vec<u8>> {
    let body = encode_entries(entries);
    let nonce_bytes: [u8; 12] = rand::random();

    let derived = key.derive(salt);
    let cipher = Aes256Gcm::new_from_slice(derived.as_bytes())
        .map_err(|_| VaultError::corrupted("bad derived key length"))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), body.as_slice())
        .map_err(|_| VaultError::corrupted("encryption failure"))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens container bytes with the given key.
///
/// AEAD failures map to [`VaultError::InvalidKey`]; structural failures
/// map to [`VaultError::Corrupted`].
pub(crate) fn unseal(key: &VaultKey, bytes: &[u8]) -> VaultResult<Container> {
    if bytes.len() < HEADER_SIZE {
        return Err(VaultError::corrupted("container too short"));
    }
    if bytes[0..4] != MAGIC {
        return Err(VaultError::corrupted("invalid container magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version > FORMAT_VERSION {
        return Err(VaultError::UnsupportedVersion { version });
    }

    let id = FileId::from_slice(&bytes[6..22]).ok_or_else(|| {
        VaultError::corrupted("invalid vault id")
    })?;
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&bytes[22..38]);
    let nonce = &bytes[38..50];
    let ciphertext = &bytes[HEADER_SIZE..];

    let derived = key.derive(&salt);
    let cipher = Aes256Gcm::new_from_slice(derived.as_bytes())
        .map_err(|_| VaultError::corrupted("bad derived key length"))?;
    let body = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::InvalidKey)?;

    let entries = decode_entries(&body)?;
    Ok(Container { id, salt, entries })
}

fn encode_entries(entries: &BTreeMap<Uuid, Entry>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    // BTreeMap iteration keeps the encoding deterministic.
    for (id, entry) in entries {
        buf.extend_from_slice(id.as_bytes());
        put_str(&mut buf, &entry.group);
        put_str(&mut buf, &entry.title);
        buf.extend_from_slice(&(entry.fields.len() as u32).to_le_bytes());
        for (k, v) in &entry.fields {
            put_str(&mut buf, k);
            put_str(&mut buf, v);
        }
        buf.extend_from_slice(&entry.updated_at.to_le_bytes());
        buf.push(u8::from(entry.trashed));
    }
    buf
}

fn decode_entries(body: &[u8]) -> VaultResult<BTreeMap<Uuid, Entry>> {
    let mut r = Reader::new(body);
    let count = r.u32()? as usize;

    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let id_bytes = r.take(16)?;
        let mut id = [0u8; 16];
        id.copy_from_slice(id_bytes);
        let id = Uuid::from_bytes(id);

        let group = r.str()?;
        let title = r.str()?;

        let field_count = r.u32()? as usize;
        let mut fields = BTreeMap::new();
        for _ in 0..field_count {
            let k = r.str()?;
            let v = r.str()?;
            fields.insert(k, v);
        }

        let updated_at = r.u64()?;
        let trashed = r.u8()? != 0;

        entries.insert(
            id,
            Entry {
                id,
                group,
                title,
                fields,
                updated_at,
                trashed,
            },
        );
    }

    if !r.at_end() {
        return Err(VaultError::corrupted("trailing bytes in body"));
    }
    Ok(entries)
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Cursor over the plaintext body with bounds-checked reads.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> VaultResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(VaultError::corrupted("body too short"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> VaultResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> VaultResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> VaultResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn str(&mut self) -> VaultResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VaultError::corrupted("invalid utf-8 string"))
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> BTreeMap<Uuid, Entry> {
        let mut entries = BTreeMap::new();
        let id = Uuid::new_v4();
        let mut fields = BTreeMap::new();
        fields.insert("UserName".to_string(), "alice".to_string());
        fields.insert("Password".to_string(), "p4ss".to_string());
        entries.insert(
            id,
            Entry {
                id,
                group: "Web".to_string(),
                title: "example.com".to_string(),
                fields,
                updated_at: 1_700_000_000_000,
                trashed: false,
            },
        );
        entries
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let key = VaultKey::from_password("pw");
        let id = FileId::new();
        let salt: [u8; 16] = rand::random();
        let entries = sample_entries();

        let bytes = seal(id, &salt, &key, &entries).unwrap();
        let container = unseal(&key, &bytes).unwrap();

        assert_eq!(container.id, id);
        assert_eq!(container.salt, salt);
        assert_eq!(container.entries, entries);
    }

    #[test]
    fn wrong_key_is_invalid_key() {
        let id = FileId::new();
        let salt: [u8; 16] = rand::random();
        let bytes = seal(id, &salt, &VaultKey::from_password("right"), &sample_entries()).unwrap();

        let err = unseal(&VaultKey::from_password("wrong"), &bytes).unwrap_err();
        assert!(err.is_invalid_key());
    }

    #[test]
    fn bad_magic_is_corrupted() {
        let err = unseal(&VaultKey::from_password("pw"), b"XXXXnotavault___________________________________________")
            .unwrap_err();
        assert!(matches!(err, VaultError::Corrupted { .. }));
    }

    #[test]
    fn truncated_container_is_corrupted() {
        let err = unseal(&VaultKey::from_password("pw"), b"LSVT").unwrap_err();
        assert!(matches!(err, VaultError::Corrupted { .. }));
    }

    #[test]
    fn future_version_rejected() {
        let key = VaultKey::from_password("pw");
        let mut bytes = seal(FileId::new(), &[0u8; 16], &key, &BTreeMap::new()).unwrap();
        bytes[4..6].copy_from_slice(&99u16.to_le_bytes());

        let err = unseal(&key, &bytes).unwrap_err();
        assert!(matches!(err, VaultError::UnsupportedVersion { version: 99 }));
    }

    #[test]
    fn tampered_ciphertext_is_invalid_key() {
        let key = VaultKey::from_password("pw");
        let mut bytes = seal(FileId::new(), &[0u8; 16], &key, &sample_entries()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(unseal(&key, &bytes).unwrap_err().is_invalid_key());
    }
}
