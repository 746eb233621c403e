//! Persistence layer for hidevault.
//!
//! Two independent stores back a vault:
//! - a [`MetadataRepository`] holding folder and file rows (SQLite in
//!   production, in-memory for tests)
//! - a [`BlobArea`] on the local filesystem holding ciphertext under opaque
//!   names
//!
//! Neither store ever sees plaintext or unwrapped keys.

pub mod local;
pub mod memory;
pub mod repository;
pub mod sqlite;
pub mod timeout;

pub use local::{
    create_private_dir, create_private_file, generate_opaque_name, BlobArea, PendingFile,
};
pub use memory::MemoryRepository;
pub use repository::{
    FileRecord, FolderCredentials, FolderRecord, MediaHints, MetadataRepository, NewFile,
    NewFolder,
};
pub use sqlite::SqliteRepository;
pub use timeout::TimeoutRepository;
