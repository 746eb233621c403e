//! Engine facade used by front ends.

use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use crate::cache::{TempArtifact, TempCacheManager};
use crate::config::EngineConfig;
use crate::operations::{BatchImportReport, ImportRequest, VaultStorage};
use crate::source::ByteSource;
use hidevault_common::{FileId, FolderId, Result};
use hidevault_crypto::FileCipher;
use hidevault_storage::{
    BlobArea, FileRecord, FolderRecord, MetadataRepository, SqliteRepository, TimeoutRepository,
};

/// Vault engine: storage operations plus the scratch cache for viewers.
pub struct VaultManager {
    storage: VaultStorage,
    cache: TempCacheManager,
}

impl VaultManager {
    /// Assemble an engine from its parts.
    ///
    /// # Postconditions
    /// - Scratch files left over from an earlier run are removed
    pub fn new(storage: VaultStorage, cache: TempCacheManager) -> Result<Self> {
        cache.cleanup_all()?;
        Ok(Self { storage, cache })
    }

    /// Open an engine backed by SQLite metadata as described by `config`.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Database or filesystem failures
    pub fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.metadata_path.parent() {
            hidevault_storage::create_private_dir(parent)?;
        }
        let repository = Arc::new(SqliteRepository::open(&config.metadata_path)?);
        Self::with_repository(config, repository)
    }

    /// Open an engine over a caller-supplied repository.
    pub fn with_repository(
        config: &EngineConfig,
        repository: Arc<dyn MetadataRepository>,
    ) -> Result<Self> {
        config.validate()?;

        let repository: Arc<dyn MetadataRepository> = match config.repository_timeout() {
            Some(deadline) => Arc::new(TimeoutRepository::new(repository, deadline)),
            None => repository,
        };
        let blobs = BlobArea::new(&config.storage_root)?;
        let cipher = FileCipher::with_chunk_size(config.chunk_size)?;
        let storage = VaultStorage::new(repository, blobs, config.kdf_params, cipher);
        let cache = TempCacheManager::new(&config.scratch_dir, &config.storage_root)?;

        info!(repository = storage.repository().name(), "Vault engine ready");
        Self::new(storage, cache)
    }

    /// Storage operations.
    pub fn storage(&self) -> &VaultStorage {
        &self.storage
    }

    /// Scratch cache.
    pub fn cache(&self) -> &TempCacheManager {
        &self.cache
    }

    pub async fn create_folder(
        &self,
        name: &str,
        password: &[u8],
        parent: Option<FolderId>,
    ) -> Result<FolderId> {
        self.storage.create_folder(name, password, parent).await
    }

    /// `Ok(false)` for a wrong password.
    pub async fn unlock_check(&self, folder_id: FolderId, password: &[u8]) -> Result<bool> {
        self.storage.unlock_check(folder_id, password).await
    }

    pub async fn find_folder(&self, name: &str) -> Result<FolderRecord> {
        self.storage.find_folder(name).await
    }

    pub async fn list_folders(&self, parent: Option<FolderId>) -> Result<Vec<FolderRecord>> {
        self.storage.list_folders(parent).await
    }

    pub async fn import_file(
        &self,
        folder_id: FolderId,
        password: &[u8],
        source: impl ByteSource + 'static,
        display_name: &str,
        mime_type: &str,
    ) -> Result<FileId> {
        let request = ImportRequest::new(source, display_name, mime_type);
        self.storage.import_file(folder_id, password, request).await
    }

    pub async fn import_batch(
        &self,
        folder_id: FolderId,
        password: &[u8],
        requests: Vec<ImportRequest>,
    ) -> Result<BatchImportReport> {
        self.storage.import_batch(folder_id, password, requests).await
    }

    pub async fn list_files(&self, folder_id: FolderId) -> Result<Vec<FileRecord>> {
        self.storage.list_files(folder_id).await
    }

    /// Decrypt a file into the scratch area for an external viewer.
    ///
    /// Release the artifact with [`Self::release_artifact`] when the viewer
    /// is done.
    pub async fn open_file(&self, file_id: FileId, password: &[u8]) -> Result<TempArtifact> {
        self.cache
            .materialize(&self.storage, file_id, password)
            .await
    }

    /// Decrypt a file into memory.
    pub async fn read_file(&self, file_id: FileId, password: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.storage.read_file(file_id, password).await
    }

    pub async fn delete_file(&self, file_id: FileId) -> Result<()> {
        self.storage.delete_file(file_id).await
    }

    pub async fn delete_folder(&self, folder_id: FolderId) -> Result<()> {
        self.storage.delete_folder(folder_id).await
    }

    pub async fn change_password(
        &self,
        folder_id: FolderId,
        old_password: &[u8],
        new_password: &[u8],
    ) -> Result<()> {
        self.storage
            .change_password(folder_id, old_password, new_password)
            .await
    }

    /// Remove an artifact's plaintext copy. Safe to call more than once.
    pub fn release_artifact(&self, artifact: &TempArtifact) -> Result<()> {
        self.cache.cleanup(artifact.path()).map(|_| ())
    }

    /// Sweep the scratch area and stop the engine.
    ///
    /// Returns the number of scratch files removed.
    pub fn shutdown(self) -> Result<usize> {
        let removed = self.cache.cleanup_all()?;
        info!(removed, "Vault engine shut down");
        Ok(removed)
    }
}
