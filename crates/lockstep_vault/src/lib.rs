//! # Lockstep Vault
//!
//! Encrypted password-database container for Lockstep.
//!
//! A [`Vault`] is the runtime form of one database file: an encrypted
//! collection of entries together with the bookkeeping flags the sync
//! engine drives (`modified`, `dirty`, `syncing`, revision mirror). The
//! engine treats vault bytes as opaque - everything it needs goes through
//! the operations on [`Vault`].
//!
//! ## Container format
//!
//! Files are sealed with AES-256-GCM under a key derived from the master
//! password and an optional key file. The container header carries a
//! stable vault id, so re-opening the same database - from any backend or
//! path - yields the same id.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod format;
mod id;
mod key;
mod vault;
mod xml;

pub use error::{VaultError, VaultResult};
pub use id::FileId;
pub use key::{hash_from_hex, hash_key_file, hash_to_hex, DerivedKey, VaultKey, KEY_FILE_HASH_SIZE};
pub use vault::{Entry, Vault};
pub use xml::parse_xml_entries;
