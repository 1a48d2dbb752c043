//! Key material and key derivation.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a key-file hash in bytes.
pub const KEY_FILE_HASH_SIZE: usize = 32;

/// Number of hash rounds in the key derivation.
const KDF_ROUNDS: u32 = 4096;

/// Master key material for a vault: a password plus an optional key file.
///
/// Only the key file's SHA-256 hash enters the derivation, which is what
/// makes "remember key files" possible: the registry stores the hash, and
/// [`VaultKey::with_key_file_hash`] rebuilds equivalent key material
/// without the original file.
///
/// The password and all derived bytes are zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    password: String,
    key_file_hash: Option<[u8; KEY_FILE_HASH_SIZE]>,
}

impl VaultKey {
    /// Creates key material from a password alone.
    #[must_use]
    pub fn from_password(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            key_file_hash: None,
        }
    }

    /// Creates key material from a password and key-file contents.
    #[must_use]
    pub fn new(password: impl Into<String>, key_file: &[u8]) -> Self {
        Self {
            password: password.into(),
            key_file_hash: Some(hash_key_file(key_file)),
        }
    }

    /// Rebuilds key material from a password and a remembered key-file hash.
    #[must_use]
    pub fn with_key_file_hash(
        password: impl Into<String>,
        hash: [u8; KEY_FILE_HASH_SIZE],
    ) -> Self {
        Self {
            password: password.into(),
            key_file_hash: Some(hash),
        }
    }

    /// Returns the key-file hash, if a key file is part of this key.
    #[must_use]
    pub fn key_file_hash(&self) -> Option<&[u8; KEY_FILE_HASH_SIZE]> {
        self.key_file_hash.as_ref()
    }

    /// Derives the 32-byte AEAD key for a container salt.
    ///
    /// Iterated SHA-256 over password, salt, and key-file hash. The salt
    /// lives in the container header, so the same `VaultKey` yields
    /// different AEAD keys for different containers.
    #[must_use]
    pub fn derive(&self, salt: &[u8; 16]) -> DerivedKey {
        let mut hasher = Sha256::new();
        hasher.update(self.password.as_bytes());
        hasher.update(salt);
        if let Some(hash) = &self.key_file_hash {
            hasher.update(hash);
        }
        let mut state: [u8; 32] = hasher.finalize().into();

        for _ in 1..KDF_ROUNDS {
            let mut hasher = Sha256::new();
            hasher.update(state);
            hasher.update(salt);
            state = hasher.finalize().into();
        }

        DerivedKey { bytes: state }
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("password", &"[REDACTED]")
            .field("key_file", &self.key_file_hash.is_some())
            .finish()
    }
}

/// A derived AEAD key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; 32],
}

impl DerivedKey {
    /// Returns the key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Hashes key-file contents for derivation and registry hints.
#[must_use]
pub fn hash_key_file(key_file: &[u8]) -> [u8; KEY_FILE_HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(key_file);
    hasher.finalize().into()
}

/// Encodes a key-file hash for persistence.
#[must_use]
pub fn hash_to_hex(hash: &[u8; KEY_FILE_HASH_SIZE]) -> String {
    let mut out = String::with_capacity(KEY_FILE_HASH_SIZE * 2);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Decodes a persisted key-file hash.
#[must_use]
pub fn hash_from_hex(hex: &str) -> Option<[u8; KEY_FILE_HASH_SIZE]> {
    if hex.len() != KEY_FILE_HASH_SIZE * 2 {
        return None;
    }
    let mut out = [0u8; KEY_FILE_HASH_SIZE];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(out)
}
