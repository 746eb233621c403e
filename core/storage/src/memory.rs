//! In-memory metadata repository for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::repository::{
    FileRecord, FolderCredentials, FolderRecord, MetadataRepository, NewFile, NewFolder,
};
use hidevault_common::{Error, FileId, FolderId, Result};
use hidevault_crypto::WrappedKey;

#[derive(Debug, Default)]
struct State {
    last_folder_id: i64,
    last_file_id: i64,
    folders: BTreeMap<FolderId, FolderRecord>,
    files: BTreeMap<FileId, FileRecord>,
}

impl State {
    fn sibling_exists(&self, parent: Option<FolderId>, name: &str) -> bool {
        self.folders
            .values()
            .any(|f| f.parent_id == parent && f.name == name)
    }
}

/// In-memory metadata repository.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Ids start at 1 and are never reused.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<State>>,
}

impl MemoryRepository {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Storage("Repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Storage("Repository lock poisoned".to_string()))
    }
}

#[async_trait]
impl MetadataRepository for MemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_folder(&self, folder: NewFolder) -> Result<FolderId> {
        let mut state = self.write()?;

        if let Some(parent) = folder.parent_id {
            if !state.folders.contains_key(&parent) {
                return Err(Error::NotFound(format!("Parent folder {}", parent)));
            }
        }
        if state.sibling_exists(folder.parent_id, &folder.name) {
            return Err(Error::AlreadyExists(format!(
                "Folder named '{}' already exists here",
                folder.name
            )));
        }

        state.last_folder_id += 1;
        let id = FolderId::new(state.last_folder_id);
        let now = Utc::now();
        state.folders.insert(
            id,
            FolderRecord {
                id,
                name: folder.name,
                parent_id: folder.parent_id,
                salt: folder.salt,
                password_hash: folder.password_hash,
                kdf_params: folder.kdf_params,
                created_at: now,
                modified_at: now,
            },
        );
        Ok(id)
    }

    async fn get_folder(&self, id: FolderId) -> Result<Option<FolderRecord>> {
        Ok(self.read()?.folders.get(&id).cloned())
    }

    async fn find_folder_by_name(&self, name: &str) -> Result<Option<FolderRecord>> {
        Ok(self
            .read()?
            .folders
            .values()
            .find(|f| f.name == name)
            .cloned())
    }

    async fn list_child_folders(&self, parent: Option<FolderId>) -> Result<Vec<FolderRecord>> {
        Ok(self
            .read()?
            .folders
            .values()
            .filter(|f| f.parent_id == parent)
            .cloned()
            .collect())
    }

    async fn delete_folder(&self, id: FolderId) -> Result<()> {
        let mut state = self.write()?;

        if !state.folders.contains_key(&id) {
            return Err(Error::NotFound(format!("Folder {}", id)));
        }
        if state.files.values().any(|f| f.folder_id == id) {
            return Err(Error::Conflict(format!("Folder {} still has files", id)));
        }
        if state.folders.values().any(|f| f.parent_id == Some(id)) {
            return Err(Error::Conflict(format!("Folder {} still has subfolders", id)));
        }

        state.folders.remove(&id);
        Ok(())
    }

    async fn rekey_folder(
        &self,
        id: FolderId,
        credentials: FolderCredentials,
        wrapped_keys: Vec<(FileId, WrappedKey)>,
    ) -> Result<()> {
        let mut state = self.write()?;

        if !state.folders.contains_key(&id) {
            return Err(Error::NotFound(format!("Folder {}", id)));
        }

        let current: BTreeSet<FileId> = state
            .files
            .values()
            .filter(|f| f.folder_id == id)
            .map(|f| f.id)
            .collect();
        let supplied: BTreeSet<FileId> = wrapped_keys.iter().map(|(file_id, _)| *file_id).collect();
        if current != supplied || supplied.len() != wrapped_keys.len() {
            return Err(Error::Conflict(format!(
                "Rekey of folder {} does not cover its current files",
                id
            )));
        }

        for (file_id, wrapped) in wrapped_keys {
            if let Some(file) = state.files.get_mut(&file_id) {
                file.wrapped_key = wrapped;
            }
        }
        if let Some(folder) = state.folders.get_mut(&id) {
            folder.salt = credentials.salt;
            folder.password_hash = credentials.password_hash;
            folder.kdf_params = credentials.kdf_params;
            folder.modified_at = Utc::now();
        }
        Ok(())
    }

    async fn create_file(&self, file: NewFile) -> Result<FileId> {
        let mut state = self.write()?;

        match state.folders.get(&file.folder_id) {
            None => return Err(Error::NotFound(format!("Folder {}", file.folder_id))),
            Some(folder) if folder.salt != file.wrapped_under_salt => {
                return Err(Error::Conflict(format!(
                    "Folder {} was rekeyed during the import",
                    file.folder_id
                )));
            }
            Some(_) => {}
        }

        state.last_file_id += 1;
        let id = FileId::new(state.last_file_id);
        state.files.insert(
            id,
            FileRecord {
                id,
                folder_id: file.folder_id,
                original_file_name: file.original_file_name,
                mime_type: file.mime_type,
                encrypted_file_name: file.encrypted_file_name,
                file_size: file.file_size,
                encrypted_size: file.encrypted_size,
                wrapped_key: file.wrapped_key,
                media: file.media,
                created_at: Utc::now(),
            },
        );
        if let Some(folder) = state.folders.get_mut(&file.folder_id) {
            folder.modified_at = Utc::now();
        }
        Ok(id)
    }

    async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>> {
        Ok(self.read()?.files.get(&id).cloned())
    }

    async fn list_files(&self, folder_id: FolderId) -> Result<Vec<FileRecord>> {
        Ok(self
            .read()?
            .files
            .values()
            .filter(|f| f.folder_id == folder_id)
            .cloned()
            .collect())
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        self.write()?
            .files
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("File {}", id)))
    }
}
