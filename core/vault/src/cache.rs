//! Scratch area for decrypted copies.
//!
//! External viewers need a real file path, so opening a file writes its
//! plaintext into a scratch directory. Every copy created here is tracked
//! until it is released; whatever is left is swept on startup, on shutdown
//! and when the manager is dropped.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::operations::{task_failed, VaultStorage};
use hidevault_common::{Error, FileId, Result};
use hidevault_storage::{create_private_dir, create_private_file, PendingFile};

/// Longest original extension carried over to a scratch file name.
const MAX_EXTENSION_LEN: usize = 16;

/// A decrypted copy in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempArtifact {
    path: PathBuf,
    file_id: FileId,
    mime_type: String,
    size: u64,
}

impl TempArtifact {
    /// Location of the plaintext copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File the copy was made from.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Plaintext length.
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Extension of the original name, if it is short and alphanumeric.
fn scratch_extension(original_name: &str) -> Option<&str> {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        })
}

/// Whether `name` has the `<uuid>[.<ext>]` form given to scratch files.
fn is_scratch_name(name: &str) -> bool {
    let (stem, ext) = match name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let ext_ok = ext.map_or(true, |ext| scratch_extension(name) == Some(ext));
    stem.len() == 36 && Uuid::parse_str(stem).is_ok() && ext_ok
}

/// Owner of the scratch directory and the plaintext copies in it.
#[derive(Debug)]
pub struct TempCacheManager {
    scratch_dir: PathBuf,
    tracked: Mutex<HashSet<PathBuf>>,
}

impl TempCacheManager {
    /// Create a manager over `scratch_dir`.
    ///
    /// # Postconditions
    /// - Scratch directory exists with owner-only permissions
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the scratch directory and `storage_root`
    ///   lie inside one another
    pub fn new(scratch_dir: impl AsRef<Path>, storage_root: impl AsRef<Path>) -> Result<Self> {
        let storage_root = normalize(storage_root.as_ref());
        let requested = scratch_dir.as_ref();
        if normalize(requested).starts_with(&storage_root) {
            return Err(Error::InvalidInput(
                "Scratch directory must be outside the storage root".to_string(),
            ));
        }

        create_private_dir(requested)?;
        let scratch_dir = normalize(requested);
        if scratch_dir.starts_with(&storage_root) || storage_root.starts_with(&scratch_dir) {
            return Err(Error::InvalidInput(
                "Scratch directory must be outside the storage root".to_string(),
            ));
        }

        Ok(Self {
            scratch_dir,
            tracked: Mutex::new(HashSet::new()),
        })
    }

    /// Scratch directory.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn tracked(&self) -> Result<MutexGuard<'_, HashSet<PathBuf>>> {
        self.tracked
            .lock()
            .map_err(|_| Error::Storage("Artifact registry lock poisoned".to_string()))
    }

    /// Number of artifacts not yet released.
    pub fn tracked_count(&self) -> usize {
        self.tracked().map(|t| t.len()).unwrap_or(0)
    }

    /// Decrypt a file into a new scratch file.
    ///
    /// The password is checked and the content key unwrapped before any
    /// scratch file is created.
    ///
    /// # Errors
    /// - Any error from [`VaultStorage::unlock_file`] or
    ///   [`VaultStorage::decrypt_to`]; the partial scratch file is removed
    pub async fn materialize(
        &self,
        storage: &VaultStorage,
        file_id: FileId,
        password: &[u8],
    ) -> Result<TempArtifact> {
        let unlocked = storage.unlock_file(file_id, password).await?;
        let record = unlocked.record().clone();

        let name = match scratch_extension(&record.original_file_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.scratch_dir.join(name);

        let target = path.clone();
        let (pending, file) = tokio::task::spawn_blocking(move || -> Result<_> {
            let file = create_private_file(&target)?;
            Ok((PendingFile::new(target), file))
        })
        .await
        .map_err(task_failed)??;

        let writer = storage.decrypt_to(unlocked, BufWriter::new(file)).await?;
        writer.into_inner().map_err(|e| e.into_error())?;

        self.tracked()?.insert(path.clone());
        pending.commit();

        debug!(file_id = %file_id, size = record.file_size, "Artifact materialized");
        Ok(TempArtifact {
            path,
            file_id,
            mime_type: record.mime_type,
            size: record.file_size,
        })
    }

    fn is_inside_scratch(&self, path: &Path) -> bool {
        path != self.scratch_dir
            && path.starts_with(&self.scratch_dir)
            && !path.components().any(|c| matches!(c, Component::ParentDir))
    }

    /// Remove one scratch file.
    ///
    /// Idempotent: returns `Ok(false)` if the file is already gone.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if `path` is not inside the scratch directory
    pub fn cleanup(&self, path: &Path) -> Result<bool> {
        if !self.is_inside_scratch(path) {
            return Err(Error::InvalidInput(
                "Refusing to remove a path outside the scratch directory".to_string(),
            ));
        }

        let removed = match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        self.tracked()?.remove(path);

        debug!(removed, "Artifact cleaned up");
        Ok(removed)
    }

    /// Remove every scratch file in the scratch directory, tracked or not.
    ///
    /// Only names of the `<uuid>[.<ext>]` form are touched; anything else in
    /// the directory is left alone. Returns the number of files removed. All
    /// entries are attempted; the first failure is returned afterwards.
    pub fn cleanup_all(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        let mut first_error = None;
        for entry in entries {
            let result = entry.and_then(|entry| {
                if entry.file_type()?.is_dir() {
                    return Ok(false);
                }
                if !entry.file_name().to_str().is_some_and(is_scratch_name) {
                    debug!("Skipping foreign file in scratch directory");
                    return Ok(false);
                }
                fs::remove_file(entry.path()).map(|_| true)
            });
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to remove scratch file");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.tracked()?.clear();

        if removed > 0 {
            info!(removed, "Scratch directory swept");
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }
}

impl Drop for TempCacheManager {
    fn drop(&mut self) {
        let tracked = match self.tracked.get_mut() {
            Ok(tracked) => std::mem::take(tracked),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for path in tracked {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "Failed to remove artifact on drop"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::tests::{photo, storage};
    use crate::operations::ImportRequest;
    use crate::source::MemorySource;
    use tempfile::TempDir;

    async fn setup(temp: &TempDir) -> (VaultStorage, TempCacheManager, FileId) {
        let storage = storage(temp);
        let cache = TempCacheManager::new(temp.path().join("scratch"), temp.path().join("blobs"))
            .unwrap();

        let folder = storage
            .create_folder("Private", b"abcd1234", None)
            .await
            .unwrap();
        let file_id = storage
            .import_file(
                folder,
                b"abcd1234",
                ImportRequest::new(MemorySource::new(photo()), "photo.jpg", "image/jpeg"),
            )
            .await
            .unwrap();
        (storage, cache, file_id)
    }

    fn scratch_files(cache: &TempCacheManager) -> usize {
        fs::read_dir(cache.scratch_dir()).unwrap().count()
    }

    #[test]
    fn test_scratch_extension() {
        assert_eq!(scratch_extension("photo.jpg"), Some("jpg"));
        assert_eq!(scratch_extension("archive.tar.gz"), Some("gz"));
        assert_eq!(scratch_extension("noext"), None);
        assert_eq!(scratch_extension("weird.j p g"), None);
        assert_eq!(scratch_extension("evil.x/../y"), None);
    }

    #[test]
    fn test_scratch_inside_storage_rejected() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("blobs");
        fs::create_dir_all(&root).unwrap();

        assert!(matches!(
            TempCacheManager::new(root.join("tmp"), &root),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            TempCacheManager::new(&root, &root),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_materialize_and_release() {
        let temp = TempDir::new().unwrap();
        let (storage, cache, file_id) = setup(&temp).await;

        let artifact = cache
            .materialize(&storage, file_id, b"abcd1234")
            .await
            .unwrap();

        assert_eq!(artifact.file_id(), file_id);
        assert_eq!(artifact.size(), 10240);
        assert_eq!(artifact.mime_type(), "image/jpeg");
        assert!(artifact.path().starts_with(cache.scratch_dir()));
        assert_eq!(
            artifact.path().extension().and_then(|e| e.to_str()),
            Some("jpg")
        );
        assert_eq!(fs::read(artifact.path()).unwrap(), photo());
        assert_eq!(cache.tracked_count(), 1);

        assert!(cache.cleanup(artifact.path()).unwrap());
        assert!(!artifact.path().exists());
        assert_eq!(cache.tracked_count(), 0);

        // Second release is a no-op
        assert!(!cache.cleanup(artifact.path()).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_artifact_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let (storage, cache, file_id) = setup(&temp).await;
        let artifact = cache
            .materialize(&storage, file_id, b"abcd1234")
            .await
            .unwrap();

        let mode = fs::metadata(artifact.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_wrong_password_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let (storage, cache, file_id) = setup(&temp).await;

        let err = cache
            .materialize(&storage, file_id, b"wrong")
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(scratch_files(&cache), 0);
        assert_eq!(cache.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_blob_leaves_no_artifact() {
        let temp = TempDir::new().unwrap();
        let (storage, cache, file_id) = setup(&temp).await;

        let record = storage.file(file_id).await.unwrap();
        let path = storage
            .blobs()
            .blob_path(record.folder_id, &record.encrypted_file_name)
            .unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(cache
            .materialize(&storage, file_id, b"abcd1234")
            .await
            .unwrap_err()
            .is_corrupted());
        assert_eq!(scratch_files(&cache), 0);
    }

    #[test]
    fn test_cleanup_refuses_outside_paths() {
        let temp = TempDir::new().unwrap();
        let cache =
            TempCacheManager::new(temp.path().join("scratch"), temp.path().join("blobs")).unwrap();

        let outside = temp.path().join("keep.txt");
        fs::write(&outside, b"keep").unwrap();

        assert!(matches!(cache.cleanup(&outside), Err(Error::InvalidInput(_))));
        let sneaky = cache.scratch_dir().join("..").join("keep.txt");
        assert!(matches!(cache.cleanup(&sneaky), Err(Error::InvalidInput(_))));
        assert!(matches!(
            cache.cleanup(cache.scratch_dir()),
            Err(Error::InvalidInput(_))
        ));
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_cleanup_all_sweeps_orphans() {
        let temp = TempDir::new().unwrap();
        let (storage, cache, file_id) = setup(&temp).await;

        cache
            .materialize(&storage, file_id, b"abcd1234")
            .await
            .unwrap();
        cache
            .materialize(&storage, file_id, b"abcd1234")
            .await
            .unwrap();
        // Left over from an earlier crash
        let orphan = format!("{}.jpg", Uuid::new_v4());
        fs::write(cache.scratch_dir().join(orphan), b"stale").unwrap();

        assert_eq!(cache.cleanup_all().unwrap(), 3);
        assert_eq!(scratch_files(&cache), 0);
        assert_eq!(cache.tracked_count(), 0);
        assert_eq!(cache.cleanup_all().unwrap(), 0);
    }

    #[test]
    fn test_cleanup_all_keeps_foreign_files() {
        let temp = TempDir::new().unwrap();
        let cache =
            TempCacheManager::new(temp.path().join("scratch"), temp.path().join("blobs")).unwrap();

        let foreign = ["holiday.jpg", "notes", "report.final.pdf"];
        for name in foreign {
            fs::write(cache.scratch_dir().join(name), b"keep").unwrap();
        }
        fs::write(cache.scratch_dir().join(Uuid::new_v4().to_string()), b"x").unwrap();

        assert_eq!(cache.cleanup_all().unwrap(), 1);
        for name in foreign {
            assert!(cache.scratch_dir().join(name).exists());
        }
    }

    #[test]
    fn test_scratch_names() {
        let id = Uuid::new_v4();
        assert!(is_scratch_name(&id.to_string()));
        assert!(is_scratch_name(&format!("{}.jpg", id)));
        assert!(!is_scratch_name(&format!("{}.tar.gz", id)));
        assert!(!is_scratch_name(&format!("{}.", id)));
        assert!(!is_scratch_name(&id.simple().to_string()));
        assert!(!is_scratch_name("photo.jpg"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_materialize_leaves_no_artifact() {
        use std::process::Command;
        use std::time::Duration;

        let temp = TempDir::new().unwrap();
        let (storage, cache, file_id) = setup(&temp).await;

        // A FIFO in place of the blob stalls decryption until a writer opens it.
        let record = storage.file(file_id).await.unwrap();
        let blob = storage
            .blobs()
            .blob_path(record.folder_id, &record.encrypted_file_name)
            .unwrap();
        fs::remove_file(&blob).unwrap();
        assert!(Command::new("mkfifo").arg(&blob).status().unwrap().success());

        let appeared = async {
            while scratch_files(&cache) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        tokio::select! {
            result = cache.materialize(&storage, file_id, b"abcd1234") => {
                panic!("materialize finished while stalled: {:?}", result)
            }
            _ = appeared => {}
        }

        for _ in 0..100 {
            if scratch_files(&cache) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scratch_files(&cache), 0);
        assert_eq!(cache.tracked_count(), 0);

        // Unblock the abandoned decrypt; it fails on the empty stream.
        // Opening read-write does not wait for the other end.
        drop(
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&blob)
                .unwrap(),
        );
    }

    #[tokio::test]
    async fn test_drop_removes_tracked() {
        let temp = TempDir::new().unwrap();
        let (storage, cache, file_id) = setup(&temp).await;

        let artifact = cache
            .materialize(&storage, file_id, b"abcd1234")
            .await
            .unwrap();
        assert!(artifact.path().exists());

        drop(cache);
        assert!(!artifact.path().exists());
    }
}
