//! Local filesystem blob area.
//!
//! Ciphertext blobs live under `root/<folder id>/<opaque name>`. Names are
//! random hex tokens with no relation to the original file name, so the
//! directory listing reveals nothing beyond blob count and size.
//!
//! The API is synchronous; async callers run it on the blocking pool.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use hidevault_common::{Error, FolderId, Result};

/// Random bytes behind an opaque blob name.
pub const OPAQUE_NAME_BYTES: usize = 32;

const CREATE_ATTEMPTS: usize = 4;

/// Generate a fresh opaque blob name (64 lowercase hex characters).
pub fn generate_opaque_name() -> String {
    let mut bytes = [0u8; OPAQUE_NAME_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_opaque_name(name: &str) -> bool {
    name.len() == OPAQUE_NAME_BYTES * 2
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Create a directory (and parents) readable only by the owner.
///
/// An existing directory is left as is.
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    if path.as_os_str().is_empty() || path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    restrict_dir(path)
}

/// Create a new file readable only by the owner. Fails if it exists.
pub fn create_private_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// A file that is removed on drop unless committed.
///
/// Used while a blob is being written: if anything fails before the
/// metadata row exists, dropping the guard removes the partial blob.
#[derive(Debug)]
pub struct PendingFile {
    path: Option<PathBuf>,
}

impl PendingFile {
    /// Guard an existing path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Guarded path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the file and return its path.
    pub fn commit(mut self) -> Option<PathBuf> {
        self.path.take()
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed uncommitted file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "Failed to remove uncommitted file"),
            }
        }
    }
}

/// Directory tree holding encrypted blobs.
#[derive(Debug, Clone)]
pub struct BlobArea {
    root: PathBuf,
}

impl BlobArea {
    /// Open a blob area rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        create_private_dir(&root)?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a folder's blobs.
    pub fn folder_dir(&self, folder: FolderId) -> PathBuf {
        self.root.join(folder.to_string())
    }

    /// Path of a blob. Rejects anything that is not an opaque name.
    pub fn blob_path(&self, folder: FolderId, name: &str) -> Result<PathBuf> {
        if !is_opaque_name(name) {
            return Err(Error::InvalidInput("Malformed blob name".to_string()));
        }
        Ok(self.folder_dir(folder).join(name))
    }

    /// Create a new, empty blob under a fresh opaque name.
    ///
    /// Returns the name, a guard that removes the blob unless committed,
    /// and the open file for writing.
    pub fn create_blob(&self, folder: FolderId) -> Result<(String, PendingFile, File)> {
        let dir = self.folder_dir(folder);
        create_private_dir(&dir)?;

        for _ in 0..CREATE_ATTEMPTS {
            let name = generate_opaque_name();
            let path = dir.join(&name);
            match create_private_file(&path) {
                Ok(file) => return Ok((name, PendingFile::new(path), file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::AlreadyExists(
            "Could not allocate a unique blob name".to_string(),
        ))
    }

    /// Open a blob for reading.
    ///
    /// # Errors
    /// - `Error::NotFound` if the blob is missing
    pub fn open_blob(&self, folder: FolderId, name: &str) -> Result<File> {
        let path = self.blob_path(folder, name)?;
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound("Encrypted blob is missing".to_string())
            } else {
                e.into()
            }
        })
    }

    /// Remove a blob. Returns `false` if it was already absent.
    pub fn remove_blob(&self, folder: FolderId, name: &str) -> Result<bool> {
        let path = self.blob_path(folder, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a folder's blob directory and anything left in it.
    pub fn remove_folder_area(&self, folder: FolderId) -> Result<()> {
        match fs::remove_dir_all(self.folder_dir(folder)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all blobs stored for a folder.
    pub fn list_blobs(&self, folder: FolderId) -> Result<Vec<String>> {
        let dir = self.folder_dir(folder);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if is_opaque_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    #[test]
    fn test_opaque_names() {
        let a = generate_opaque_name();
        let b = generate_opaque_name();

        assert_eq!(a.len(), 64);
        assert!(is_opaque_name(&a));
        assert_ne!(a, b);

        assert!(!is_opaque_name("photo.jpg"));
        assert!(!is_opaque_name(&"AB".repeat(32)));
        assert!(!is_opaque_name("../etc/passwd"));
    }

    #[test]
    fn test_blob_lifecycle() {
        let temp = TempDir::new().unwrap();
        let area = BlobArea::new(temp.path().join("vault")).unwrap();
        let folder = FolderId::new(1);

        let (name, pending, mut file) = area.create_blob(folder).unwrap();
        file.write_all(b"ciphertext").unwrap();
        drop(file);
        pending.commit();

        let mut data = Vec::new();
        area.open_blob(folder, &name)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"ciphertext");
        assert_eq!(area.list_blobs(folder).unwrap(), vec![name.clone()]);

        assert!(area.remove_blob(folder, &name).unwrap());
        assert!(!area.remove_blob(folder, &name).unwrap());
        assert!(matches!(
            area.open_blob(folder, &name),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_uncommitted_blob_removed() {
        let temp = TempDir::new().unwrap();
        let area = BlobArea::new(temp.path()).unwrap();
        let folder = FolderId::new(3);

        let (name, pending, file) = area.create_blob(folder).unwrap();
        drop(file);
        let path = area.blob_path(folder, &name).unwrap();
        assert!(path.exists());

        drop(pending);
        assert!(!path.exists());
    }

    #[test]
    fn test_blob_path_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let area = BlobArea::new(temp.path()).unwrap();

        assert!(matches!(
            area.blob_path(FolderId::new(1), "../../secret"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_remove_folder_area() {
        let temp = TempDir::new().unwrap();
        let area = BlobArea::new(temp.path()).unwrap();
        let folder = FolderId::new(5);

        let (_, pending, _) = area.create_blob(folder).unwrap();
        pending.commit();
        assert!(area.folder_dir(folder).exists());

        area.remove_folder_area(folder).unwrap();
        assert!(!area.folder_dir(folder).exists());
        // Absent directory is fine
        area.remove_folder_area(folder).unwrap();
        assert!(area.list_blobs(folder).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_blob_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let area = BlobArea::new(temp.path()).unwrap();
        let (name, pending, _) = area.create_blob(FolderId::new(1)).unwrap();
        pending.commit();

        let path = area.blob_path(FolderId::new(1), &name).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
