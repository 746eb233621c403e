//! Vault engine for hidevault.
//!
//! This module provides:
//! - Password-protected folders with per-folder salts and KDF parameters
//! - Import of files as independently keyed, opaquely named ciphertext
//! - Opening files into a scratch area for external viewers, with cleanup
//! - Cascading deletes and password changes that re-wrap file keys
//!
//! # Architecture
//! [`VaultStorage`] sits between front ends and the persistence layer. It
//! never keeps keys beyond a single call: every operation takes the folder
//! password (or an [`UnlockedFolder`] derived from it) explicitly.
//! [`VaultManager`] bundles it with the [`TempCacheManager`] and wires both
//! from an [`EngineConfig`].

pub mod cache;
pub mod config;
pub mod manager;
pub mod operations;
pub mod source;
pub mod unlock;

pub use cache::{TempArtifact, TempCacheManager};
pub use config::{EngineConfig, CONFIG_FILENAME};
pub use manager::VaultManager;
pub use operations::{
    BatchImportReport, ImportFailure, ImportRequest, ImportedFile, VaultStorage,
    DEFAULT_MIME_TYPE,
};
pub use source::{ByteSource, FileSource, MemorySource};
pub use unlock::{UnlockedFile, UnlockedFolder};
