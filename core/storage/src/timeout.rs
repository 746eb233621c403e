//! Deadline enforcement for repository calls.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::repository::{
    FileRecord, FolderCredentials, FolderRecord, MetadataRepository, NewFile, NewFolder,
};
use hidevault_common::{Error, FileId, FolderId, Result};
use hidevault_crypto::WrappedKey;

/// Repository wrapper that fails any call exceeding a fixed deadline with
/// `Error::Timeout`.
pub struct TimeoutRepository {
    inner: Arc<dyn MetadataRepository>,
    deadline: Duration,
}

impl TimeoutRepository {
    /// Wrap `inner`, bounding every call by `deadline`.
    pub fn new(inner: Arc<dyn MetadataRepository>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    /// Configured deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, deadline_ms = self.deadline.as_millis() as u64, "Repository call timed out");
                Err(Error::Timeout(format!(
                    "{} did not complete within {:?}",
                    op, self.deadline
                )))
            }
        }
    }
}

#[async_trait]
impl MetadataRepository for TimeoutRepository {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_folder(&self, folder: NewFolder) -> Result<FolderId> {
        self.bounded("create_folder", self.inner.create_folder(folder))
            .await
    }

    async fn get_folder(&self, id: FolderId) -> Result<Option<FolderRecord>> {
        self.bounded("get_folder", self.inner.get_folder(id)).await
    }

    async fn find_folder_by_name(&self, name: &str) -> Result<Option<FolderRecord>> {
        self.bounded("find_folder_by_name", self.inner.find_folder_by_name(name))
            .await
    }

    async fn list_child_folders(&self, parent: Option<FolderId>) -> Result<Vec<FolderRecord>> {
        self.bounded("list_child_folders", self.inner.list_child_folders(parent))
            .await
    }

    async fn delete_folder(&self, id: FolderId) -> Result<()> {
        self.bounded("delete_folder", self.inner.delete_folder(id))
            .await
    }

    async fn rekey_folder(
        &self,
        id: FolderId,
        credentials: FolderCredentials,
        wrapped_keys: Vec<(FileId, WrappedKey)>,
    ) -> Result<()> {
        self.bounded(
            "rekey_folder",
            self.inner.rekey_folder(id, credentials, wrapped_keys),
        )
        .await
    }

    async fn create_file(&self, file: NewFile) -> Result<FileId> {
        self.bounded("create_file", self.inner.create_file(file))
            .await
    }

    async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>> {
        self.bounded("get_file", self.inner.get_file(id)).await
    }

    async fn list_files(&self, folder_id: FolderId) -> Result<Vec<FileRecord>> {
        self.bounded("list_files", self.inner.list_files(folder_id))
            .await
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        self.bounded("delete_file", self.inner.delete_file(id))
            .await
    }
}
