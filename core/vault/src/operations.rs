//! Encrypted file and folder operations.
//!
//! Every operation takes the folder password (or an [`UnlockedFolder`]
//! obtained from it) explicitly. Per-file work runs in a fixed order:
//! import goes key generation, wrap, encrypt to a fresh opaque blob, then
//! metadata; open goes metadata, password check, unwrap, and only then reads
//! the ciphertext.

use std::io::{self, BufReader, BufWriter, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::source::ByteSource;
use crate::unlock::{UnlockedFile, UnlockedFolder};
use hidevault_common::{Error, FileId, FolderId, Result};
use hidevault_crypto::{
    ContentKey, FileCipher, KdfParams, KeyWrapper, MasterKey, PasswordAuthenticator, Salt,
    StreamStats,
};
use hidevault_storage::{
    BlobArea, FileRecord, FolderCredentials, FolderRecord, MediaHints, MetadataRepository,
    NewFile, NewFolder, PendingFile,
};

/// Mime type recorded when the caller supplies none.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Upper bound on the buffer preallocated by [`VaultStorage::read_file`].
const READ_PREALLOC_LIMIT: usize = 64 * 1024 * 1024;

pub(crate) fn task_failed(e: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::other(e))
}

async fn derive_master(
    authenticator: PasswordAuthenticator,
    password: &[u8],
    salt: Salt,
) -> Result<MasterKey> {
    let password = Zeroizing::new(password.to_vec());
    tokio::task::spawn_blocking(move || authenticator.derive_master(&password, &salt))
        .await
        .map_err(task_failed)?
}

fn validate_folder_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("Folder name cannot be empty".to_string()));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidInput(
            "Folder name cannot contain path separators".to_string(),
        ));
    }
    Ok(())
}

/// Output buffer that is zeroized on drop, including on error paths.
struct SecretBuffer(Zeroizing<Vec<u8>>);

impl Write for SecretBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One file to import.
pub struct ImportRequest {
    pub source: Box<dyn ByteSource>,
    /// Original file name, kept only as display metadata.
    pub display_name: String,
    pub mime_type: String,
    /// Media hints; derived from the mime type when `None`.
    pub media: Option<MediaHints>,
}

impl ImportRequest {
    pub fn new(
        source: impl ByteSource + 'static,
        display_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            source: Box::new(source),
            display_name: display_name.into(),
            mime_type: mime_type.into(),
            media: None,
        }
    }

    /// Supply explicit media hints.
    pub fn with_media(mut self, media: MediaHints) -> Self {
        self.media = Some(media);
        self
    }
}

/// A successfully imported batch item.
#[derive(Debug, Clone)]
pub struct ImportedFile {
    /// Position in the submitted batch.
    pub index: usize,
    pub display_name: String,
    pub file_id: FileId,
    /// Plaintext length.
    pub size: u64,
}

/// A batch item that failed.
#[derive(Debug)]
pub struct ImportFailure {
    /// Position in the submitted batch.
    pub index: usize,
    pub display_name: String,
    pub error: Error,
}

/// Outcome of [`VaultStorage::import_batch`].
#[derive(Debug, Default)]
pub struct BatchImportReport {
    pub imported: Vec<ImportedFile>,
    pub failed: Vec<ImportFailure>,
}

impl BatchImportReport {
    /// Whether every item was imported.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Orchestrates folders and encrypted files over a metadata repository and a
/// blob area.
#[derive(Clone)]
pub struct VaultStorage {
    repository: Arc<dyn MetadataRepository>,
    blobs: BlobArea,
    authenticator: PasswordAuthenticator,
    cipher: FileCipher,
}

impl VaultStorage {
    /// Create a storage engine.
    ///
    /// `kdf_params` applies to folders created (or rekeyed) from now on;
    /// existing folders keep the parameters stored with them.
    pub fn new(
        repository: Arc<dyn MetadataRepository>,
        blobs: BlobArea,
        kdf_params: KdfParams,
        cipher: FileCipher,
    ) -> Self {
        Self {
            repository,
            blobs,
            authenticator: PasswordAuthenticator::new(kdf_params),
            cipher,
        }
    }

    /// Metadata repository in use.
    pub fn repository(&self) -> &Arc<dyn MetadataRepository> {
        &self.repository
    }

    /// Blob area in use.
    pub fn blobs(&self) -> &BlobArea {
        &self.blobs
    }

    /// Get a folder.
    ///
    /// # Errors
    /// - `Error::NotFound` if the folder does not exist
    pub async fn folder(&self, folder_id: FolderId) -> Result<FolderRecord> {
        self.repository
            .get_folder(folder_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Folder {}", folder_id)))
    }

    /// Find a folder by display name.
    pub async fn find_folder(&self, name: &str) -> Result<FolderRecord> {
        self.repository
            .find_folder_by_name(name)
            .await?
            .ok_or_else(|| Error::NotFound("No folder with that name".to_string()))
    }

    /// Direct child folders of `parent` (top level for `None`).
    pub async fn list_folders(&self, parent: Option<FolderId>) -> Result<Vec<FolderRecord>> {
        self.repository.list_child_folders(parent).await
    }

    /// Create a password-protected folder.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for an empty or path-like name or an empty password
    /// - `Error::NotFound` if `parent` does not exist
    /// - `Error::AlreadyExists` if a sibling has the same name
    pub async fn create_folder(
        &self,
        name: &str,
        password: &[u8],
        parent: Option<FolderId>,
    ) -> Result<FolderId> {
        validate_folder_name(name)?;
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }
        if let Some(parent) = parent {
            self.folder(parent).await?;
        }

        let salt = PasswordAuthenticator::generate_salt();
        let master = derive_master(self.authenticator, password, salt.clone()).await?;

        let id = self
            .repository
            .create_folder(NewFolder {
                name: name.to_string(),
                parent_id: parent,
                salt: salt.as_bytes().to_vec(),
                password_hash: master.password_hash().as_bytes().to_vec(),
                kdf_params: *self.authenticator.params(),
            })
            .await?;

        info!(folder_id = %id, "Folder created");
        Ok(id)
    }

    /// Verify a folder password and derive its wrapping key.
    ///
    /// The password KDF runs exactly once.
    ///
    /// # Errors
    /// - `Error::NotFound` if the folder does not exist
    /// - `Error::Unauthorized` if the password is wrong
    /// - `Error::Corrupted` if the stored credentials are malformed
    pub async fn unlock_folder(
        &self,
        folder_id: FolderId,
        password: &[u8],
    ) -> Result<UnlockedFolder> {
        let folder = self.folder(folder_id).await?;
        let salt = Salt::from_slice(&folder.salt)?;

        let master = derive_master(
            PasswordAuthenticator::new(folder.kdf_params),
            password,
            salt,
        )
        .await?;

        if !PasswordAuthenticator::verify_master(&master, &folder.password_hash)? {
            debug!(folder_id = %folder_id, "Password rejected");
            return Err(Error::Unauthorized(format!(
                "Wrong password for folder {}",
                folder_id
            )));
        }

        Ok(UnlockedFolder {
            wrapping_key: master.wrapping_key(),
            folder,
        })
    }

    /// Check a folder password without doing anything else.
    ///
    /// # Returns
    /// - `Ok(true)` if the password is correct
    /// - `Ok(false)` if it is wrong
    pub async fn unlock_check(&self, folder_id: FolderId, password: &[u8]) -> Result<bool> {
        match self.unlock_folder(folder_id, password).await {
            Ok(_) => Ok(true),
            Err(Error::Unauthorized(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Import one file into a folder.
    ///
    /// # Errors
    /// - `Error::Unauthorized` if the password is wrong
    /// - Any error from [`Self::import_into`]
    pub async fn import_file(
        &self,
        folder_id: FolderId,
        password: &[u8],
        request: ImportRequest,
    ) -> Result<FileId> {
        let folder = self.unlock_folder(folder_id, password).await?;
        self.import_into(&folder, request).await
    }

    /// Import one file into an unlocked folder.
    ///
    /// # Postconditions
    /// - On success the ciphertext blob and its metadata row both exist
    /// - On any failure, or if the future is dropped, no blob is left behind
    ///
    /// # Errors
    /// - `Error::InvalidInput` for an empty display name
    /// - I/O errors reading the source or writing the blob
    /// - Repository errors persisting the row
    /// - `Error::Conflict` if the folder password changed while importing
    pub async fn import_into(
        &self,
        folder: &UnlockedFolder,
        request: ImportRequest,
    ) -> Result<FileId> {
        self.import_entry(folder, request).await.map(|(id, _)| id)
    }

    /// Import one file, returning its id and plaintext length.
    async fn import_entry(
        &self,
        folder: &UnlockedFolder,
        request: ImportRequest,
    ) -> Result<(FileId, u64)> {
        let ImportRequest {
            source,
            display_name,
            mime_type,
            media,
        } = request;

        if display_name.trim().is_empty() {
            return Err(Error::InvalidInput("File name cannot be empty".to_string()));
        }
        let mime_type = if mime_type.trim().is_empty() {
            DEFAULT_MIME_TYPE.to_string()
        } else {
            mime_type
        };
        let folder_id = folder.id();

        let content_key = ContentKey::generate();
        let wrapped_key = KeyWrapper::wrap(&content_key, &folder.wrapping_key)?;
        debug!(folder_id = %folder_id, "Content key generated");

        let blobs = self.blobs.clone();
        let cipher = self.cipher;
        let (blob_name, pending, stats) = tokio::task::spawn_blocking(
            move || -> Result<(String, PendingFile, StreamStats)> {
                let reader = source.open()?;
                let (name, pending, file) = blobs.create_blob(folder_id)?;
                let mut writer = BufWriter::new(file);
                let stats = cipher.encrypt(&content_key, reader, &mut writer)?;
                let file = writer.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                Ok((name, pending, stats))
            },
        )
        .await
        .map_err(task_failed)??;
        debug!(
            folder_id = %folder_id,
            size = stats.plaintext_len,
            "Content encrypted"
        );

        let media = media.unwrap_or_else(|| MediaHints::from_mime(&mime_type));
        let record = NewFile {
            folder_id,
            original_file_name: display_name,
            mime_type,
            encrypted_file_name: blob_name,
            file_size: stats.plaintext_len,
            encrypted_size: stats.ciphertext_len,
            wrapped_key,
            wrapped_under_salt: folder.folder.salt.clone(),
            media,
        };

        let file_id = match self.repository.create_file(record).await {
            Ok(id) => id,
            Err(e) => {
                warn!(folder_id = %folder_id, error = %e, "Metadata insert failed, discarding ciphertext");
                drop(pending);
                return Err(e);
            }
        };
        pending.commit();

        info!(
            file_id = %file_id,
            folder_id = %folder_id,
            size = stats.plaintext_len,
            "File imported"
        );
        Ok((file_id, stats.plaintext_len))
    }

    /// Import several files into one folder.
    ///
    /// The password is checked once. Items are imported in order and
    /// independently; a failing item does not stop the rest.
    ///
    /// # Errors
    /// - `Error::Unauthorized` if the password is wrong (nothing is imported)
    pub async fn import_batch(
        &self,
        folder_id: FolderId,
        password: &[u8],
        requests: Vec<ImportRequest>,
    ) -> Result<BatchImportReport> {
        let folder = self.unlock_folder(folder_id, password).await?;
        let mut report = BatchImportReport::default();

        for (index, request) in requests.into_iter().enumerate() {
            let display_name = request.display_name.clone();
            match self.import_entry(&folder, request).await {
                Ok((file_id, size)) => report.imported.push(ImportedFile {
                    index,
                    display_name,
                    file_id,
                    size,
                }),
                Err(error) => {
                    warn!(folder_id = %folder_id, index, error = %error, "Batch item failed");
                    report.failed.push(ImportFailure {
                        index,
                        display_name,
                        error,
                    });
                }
            }
        }

        info!(
            folder_id = %folder_id,
            imported = report.imported.len(),
            failed = report.failed.len(),
            "Batch import finished"
        );
        Ok(report)
    }

    /// Files of a folder, oldest first.
    pub async fn list_files(&self, folder_id: FolderId) -> Result<Vec<FileRecord>> {
        self.folder(folder_id).await?;
        self.repository.list_files(folder_id).await
    }

    /// Get a file's metadata.
    pub async fn file(&self, file_id: FileId) -> Result<FileRecord> {
        self.repository
            .get_file(file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File {}", file_id)))
    }

    /// Authenticate and unwrap a file's content key.
    ///
    /// The ciphertext is not touched.
    ///
    /// # Errors
    /// - `Error::NotFound` if the file or its folder does not exist
    /// - `Error::Unauthorized` if the password is wrong
    /// - `Error::Corrupted` if the wrapped key fails to authenticate
    pub async fn unlock_file(&self, file_id: FileId, password: &[u8]) -> Result<UnlockedFile> {
        let record = self.file(file_id).await?;
        let folder = self.unlock_folder(record.folder_id, password).await?;
        let content_key = KeyWrapper::unwrap(&record.wrapped_key, &folder.wrapping_key)?;
        debug!(file_id = %file_id, "Content key unwrapped");

        Ok(UnlockedFile {
            record,
            content_key,
        })
    }

    /// Decrypt an unlocked file into `writer` and hand the writer back.
    ///
    /// # Errors
    /// - `Error::NotFound` if the ciphertext blob is missing
    /// - `Error::Corrupted` if the ciphertext fails authentication or
    ///   decrypts to a length other than the recorded size
    pub async fn decrypt_to<W>(&self, file: UnlockedFile, writer: W) -> Result<W>
    where
        W: Write + Send + 'static,
    {
        let blobs = self.blobs.clone();
        let cipher = self.cipher;

        tokio::task::spawn_blocking(move || -> Result<W> {
            let mut writer = writer;
            let record = &file.record;
            let blob = blobs.open_blob(record.folder_id, &record.encrypted_file_name)?;
            let written = cipher.decrypt(&file.content_key, BufReader::new(blob), &mut writer)?;

            if written != record.file_size {
                return Err(Error::Corrupted(format!(
                    "File {} decrypted to {} bytes, expected {}",
                    record.id, written, record.file_size
                )));
            }
            debug!(file_id = %record.id, size = written, "Content decrypted");
            Ok(writer)
        })
        .await
        .map_err(task_failed)?
    }

    /// Decrypt a whole file into memory.
    pub async fn read_file(&self, file_id: FileId, password: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let file = self.unlock_file(file_id, password).await?;
        let capacity = usize::try_from(file.record.file_size)
            .unwrap_or(READ_PREALLOC_LIMIT)
            .min(READ_PREALLOC_LIMIT);

        let buffer = SecretBuffer(Zeroizing::new(Vec::with_capacity(capacity)));
        let SecretBuffer(data) = self.decrypt_to(file, buffer).await?;
        Ok(data)
    }

    /// Delete a file: ciphertext first, then metadata.
    ///
    /// # Errors
    /// - `Error::NotFound` if the file does not exist
    /// - I/O errors removing the ciphertext; the metadata row is kept
    pub async fn delete_file(&self, file_id: FileId) -> Result<()> {
        let record = self.file(file_id).await?;
        self.remove_file(&record).await
    }

    async fn remove_file(&self, record: &FileRecord) -> Result<()> {
        let blobs = self.blobs.clone();
        let folder_id = record.folder_id;
        let name = record.encrypted_file_name.clone();

        let removed = tokio::task::spawn_blocking(move || blobs.remove_blob(folder_id, &name))
            .await
            .map_err(task_failed)?;

        match removed {
            Ok(true) => {}
            Ok(false) => warn!(file_id = %record.id, "Ciphertext already missing"),
            Err(e) => {
                warn!(file_id = %record.id, error = %e, "Ciphertext removal failed, keeping metadata");
                return Err(e);
            }
        }

        self.repository.delete_file(record.id).await?;
        info!(file_id = %record.id, "File deleted");
        Ok(())
    }

    /// Delete a folder together with its subfolders and all their files.
    ///
    /// Descendants go first, deepest level first. Each folder loses its
    /// files, then its blob directory, then its row. A failure stops the
    /// cascade; the folder being processed keeps its row.
    pub async fn delete_folder(&self, folder_id: FolderId) -> Result<()> {
        self.folder(folder_id).await?;

        let mut order = vec![folder_id];
        let mut next = 0;
        while next < order.len() {
            let children = self.repository.list_child_folders(Some(order[next])).await?;
            order.extend(children.into_iter().map(|child| child.id));
            next += 1;
        }

        let count = order.len();
        for id in order.into_iter().rev() {
            for file in self.repository.list_files(id).await? {
                self.remove_file(&file).await?;
            }

            let blobs = self.blobs.clone();
            tokio::task::spawn_blocking(move || blobs.remove_folder_area(id))
                .await
                .map_err(task_failed)??;

            self.repository.delete_folder(id).await?;
            debug!(folder_id = %id, "Folder removed");
        }

        info!(folder_id = %folder_id, folders = count, "Folder deleted");
        Ok(())
    }

    /// Replace a folder's password.
    ///
    /// Every content key is re-wrapped under the new wrapping key; the new
    /// credentials and all wrapped keys are committed in one repository call.
    /// Ciphertext is untouched.
    ///
    /// # Errors
    /// - `Error::Unauthorized` if `old_password` is wrong
    /// - `Error::InvalidInput` if `new_password` is empty
    /// - `Error::Corrupted` if a stored wrapped key fails to unwrap
    /// - `Error::Conflict` if files were added or removed concurrently
    pub async fn change_password(
        &self,
        folder_id: FolderId,
        old_password: &[u8],
        new_password: &[u8],
    ) -> Result<()> {
        if new_password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }

        let folder = self.unlock_folder(folder_id, old_password).await?;

        let salt = PasswordAuthenticator::generate_salt();
        let master = derive_master(self.authenticator, new_password, salt.clone()).await?;
        let new_key = master.wrapping_key();

        let files = self.repository.list_files(folder_id).await?;
        let mut wrapped_keys = Vec::with_capacity(files.len());
        for file in &files {
            let rewrapped = KeyWrapper::rewrap(&file.wrapped_key, &folder.wrapping_key, &new_key)?;
            wrapped_keys.push((file.id, rewrapped));
        }

        self.repository
            .rekey_folder(
                folder_id,
                FolderCredentials {
                    salt: salt.as_bytes().to_vec(),
                    password_hash: master.password_hash().as_bytes().to_vec(),
                    kdf_params: *self.authenticator.params(),
                },
                wrapped_keys,
            )
            .await?;

        info!(folder_id = %folder_id, files = files.len(), "Folder password changed");
        Ok(())
    }
}
