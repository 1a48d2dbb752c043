//! # Lockstep Storage
//!
//! Storage backend trait and implementations for Lockstep.
//!
//! This crate provides the lowest-level storage abstraction for the sync
//! engine. Backends are **opaque byte stores** addressed by path - they do
//! not interpret the encrypted vault files they hold. Each backend reports
//! an opaque revision token with every `stat`/`load`/`save`, and the engine
//! uses only equality on those tokens.
//!
//! ## Design Principles
//!
//! - Backends expose a uniform `stat`/`load`/`save` contract
//! - Optional capabilities (stat, watch, name-to-path) are flagged, not assumed
//! - Revision tokens are opaque and equality-comparable only
//! - Must be `Send + Sync` so watcher threads can hold references
//!
//! ## Available Backends
//!
//! - [`FileStorage`] - Local filesystem, with change watching
//! - [`MemoryStorage`] - In-process remote-provider double for tests
//!
//! The always-present content-addressed cache store lives behind the
//! [`Cache`] trait, with [`DirCache`] (on disk) and [`MemoryCache`]
//! (for tests) implementations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cache;
mod error;
mod file;
mod memory;

pub use backend::{FileStat, Rev, StorageBackend, StorageOpts};
pub use cache::{Cache, DirCache, MemoryCache};
pub use error::{CacheError, CacheResult, StorageError, StorageResult};
pub use file::FileStorage;
pub use memory::MemoryStorage;
