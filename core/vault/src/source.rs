//! Plaintext inputs for import.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

/// A readable source of plaintext bytes.
///
/// `open` may be called from a blocking worker thread.
pub trait ByteSource: Send + Sync {
    /// Open a fresh reader positioned at the start.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Length in bytes, if known up front.
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// A file on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }

    fn len_hint(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

#[derive(Clone)]
struct SharedBytes(Arc<Zeroizing<Vec<u8>>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// An in-memory buffer. Zeroized when the last reader is dropped.
#[derive(Clone)]
pub struct MemorySource {
    data: SharedBytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: SharedBytes(Arc::new(Zeroizing::new(data.into()))),
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemorySource([REDACTED; {} bytes])", self.data.0.len())
    }
}

impl ByteSource for MemorySource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.data.0.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_source_rereadable() {
        let source = MemorySource::new(b"hello".to_vec());
        assert_eq!(source.len_hint(), Some(5));

        for _ in 0..2 {
            let mut out = Vec::new();
            source.open().unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, b"hello");
        }
        assert!(!format!("{:?}", source).contains("hello"));
    }

    #[test]
    fn test_file_source() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("in.bin");
        std::fs::write(&path, [7u8; 300]).unwrap();

        let source = FileSource::new(&path);
        assert_eq!(source.len_hint(), Some(300));

        let mut out = Vec::new();
        source.open().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![7u8; 300]);
    }

    #[test]
    fn test_missing_file_source() {
        let source = FileSource::new("/definitely/not/here.jpg");
        assert_eq!(source.len_hint(), None);
        assert!(source.open().is_err());
    }
}
