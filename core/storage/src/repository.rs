//! Metadata repository trait definition.
//!
//! The vault engine never talks to a database directly. Folder and file rows
//! are read and written through [`MetadataRepository`], so the persistence
//! technology behind it can change without touching the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hidevault_common::{FileId, FolderId, Result};
use hidevault_crypto::{KdfParams, WrappedKey};

/// Folder row to insert.
#[derive(Debug, Clone)]
pub struct NewFolder {
    /// Display name, unique among sibling folders.
    pub name: String,
    /// Parent folder, `None` for top-level folders.
    pub parent_id: Option<FolderId>,
    /// Random salt generated at creation.
    pub salt: Vec<u8>,
    /// One-way hash of the folder password.
    pub password_hash: Vec<u8>,
    /// KDF parameters the hash was derived with.
    pub kdf_params: KdfParams,
}

/// Stored folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: FolderId,
    pub name: String,
    pub parent_id: Option<FolderId>,
    /// Stored as raw bytes; structure is checked when the folder is unlocked.
    pub salt: Vec<u8>,
    pub password_hash: Vec<u8>,
    pub kdf_params: KdfParams,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Replacement credentials written by a password change.
#[derive(Debug, Clone)]
pub struct FolderCredentials {
    pub salt: Vec<u8>,
    pub password_hash: Vec<u8>,
    pub kdf_params: KdfParams,
}

/// Cosmetic media hints kept for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHints {
    pub is_image: bool,
    pub is_video: bool,
    pub duration_ms: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl MediaHints {
    /// Derive image/video flags from a mime type's top-level type.
    pub fn from_mime(mime_type: &str) -> Self {
        let top = mime_type
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        Self {
            is_image: top == "image",
            is_video: top == "video",
            ..Self::default()
        }
    }
}

/// File row to insert.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub folder_id: FolderId,
    pub original_file_name: String,
    pub mime_type: String,
    /// Opaque on-disk name of the ciphertext.
    pub encrypted_file_name: String,
    /// Plaintext length.
    pub file_size: u64,
    /// Ciphertext length on disk.
    pub encrypted_size: u64,
    /// Content key wrapped under the folder's wrapping key.
    pub wrapped_key: WrappedKey,
    /// Folder salt the wrapping key was derived from. The insert is refused
    /// if the folder has been rekeyed since.
    pub wrapped_under_salt: Vec<u8>,
    pub media: MediaHints,
}

/// Stored file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub folder_id: FolderId,
    pub original_file_name: String,
    pub mime_type: String,
    pub encrypted_file_name: String,
    pub file_size: u64,
    pub encrypted_size: u64,
    pub wrapped_key: WrappedKey,
    pub media: MediaHints,
    pub created_at: DateTime<Utc>,
}

/// Persistence of folder and file metadata.
///
/// Implementations provide their own atomicity for each call.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Get the repository name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Insert a folder.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if a sibling folder has the same name
    /// - `Error::NotFound` if the parent does not exist
    async fn create_folder(&self, folder: NewFolder) -> Result<FolderId>;

    /// Get a folder by id.
    async fn get_folder(&self, id: FolderId) -> Result<Option<FolderRecord>>;

    /// Find a folder by display name. The lowest id wins if several
    /// folders in different parents share the name.
    async fn find_folder_by_name(&self, name: &str) -> Result<Option<FolderRecord>>;

    /// List the direct children of `parent` (top-level folders for `None`).
    async fn list_child_folders(&self, parent: Option<FolderId>) -> Result<Vec<FolderRecord>>;

    /// Delete a folder row.
    ///
    /// # Errors
    /// - `Error::NotFound` if the folder does not exist
    /// - `Error::Conflict` if it still has files or child folders
    async fn delete_folder(&self, id: FolderId) -> Result<()>;

    /// Atomically replace a folder's credentials and the wrapped keys of all
    /// its files.
    ///
    /// # Errors
    /// - `Error::NotFound` if the folder does not exist
    /// - `Error::Conflict` if `wrapped_keys` does not cover exactly the
    ///   folder's current files
    async fn rekey_folder(
        &self,
        id: FolderId,
        credentials: FolderCredentials,
        wrapped_keys: Vec<(FileId, WrappedKey)>,
    ) -> Result<()>;

    /// Insert a file.
    ///
    /// # Errors
    /// - `Error::NotFound` if the folder does not exist
    /// - `Error::Conflict` if `wrapped_under_salt` is not the folder's
    ///   current salt
    async fn create_file(&self, file: NewFile) -> Result<FileId>;

    /// Get a file by id.
    async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>>;

    /// List the files of a folder, oldest first.
    async fn list_files(&self, folder_id: FolderId) -> Result<Vec<FileRecord>>;

    /// Delete a file row.
    ///
    /// # Errors
    /// - `Error::NotFound` if the file does not exist
    async fn delete_file(&self, id: FileId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_hints_from_mime() {
        let image = MediaHints::from_mime("image/jpeg");
        assert!(image.is_image);
        assert!(!image.is_video);

        let video = MediaHints::from_mime("Video/MP4");
        assert!(video.is_video);

        let doc = MediaHints::from_mime("application/pdf");
        assert_eq!(doc, MediaHints::default());

        assert_eq!(MediaHints::from_mime(""), MediaHints::default());
    }

    #[test]
    fn test_file_record_serialization() {
        let record = FileRecord {
            id: FileId::new(1),
            folder_id: FolderId::new(2),
            original_file_name: "photo.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            encrypted_file_name: "ab".repeat(32),
            file_size: 10240,
            encrypted_size: 10277,
            wrapped_key: WrappedKey::from_bytes(vec![1, 2, 3]),
            media: MediaHints::from_mime("image/jpeg"),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&record).unwrap();
        let restored: FileRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id, record.id);
        assert_eq!(restored.original_file_name, record.original_file_name);
        assert_eq!(restored.wrapped_key, record.wrapped_key);
    }
}
