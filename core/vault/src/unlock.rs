//! Per-operation unlock results.
//!
//! There are no long-lived sessions. A successful password check yields one of
//! these values, which the caller holds only for the duration of a single
//! operation; the keys inside are zeroized when it is dropped.

use std::fmt;

use hidevault_common::{FileId, FolderId};
use hidevault_crypto::{ContentKey, WrappingKey};
use hidevault_storage::{FileRecord, FolderRecord};

/// A folder whose password has been verified.
pub struct UnlockedFolder {
    pub(crate) folder: FolderRecord,
    pub(crate) wrapping_key: WrappingKey,
}

impl UnlockedFolder {
    /// Folder id.
    pub fn id(&self) -> FolderId {
        self.folder.id
    }

    /// Folder metadata as of the unlock.
    pub fn folder(&self) -> &FolderRecord {
        &self.folder
    }
}

impl fmt::Debug for UnlockedFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedFolder")
            .field("id", &self.folder.id)
            .field("wrapping_key", &self.wrapping_key)
            .finish()
    }
}

/// A file whose content key has been unwrapped.
pub struct UnlockedFile {
    pub(crate) record: FileRecord,
    pub(crate) content_key: ContentKey,
}

impl UnlockedFile {
    /// File id.
    pub fn id(&self) -> FileId {
        self.record.id
    }

    /// File metadata.
    pub fn record(&self) -> &FileRecord {
        &self.record
    }
}

impl fmt::Debug for UnlockedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedFile")
            .field("id", &self.record.id)
            .field("content_key", &self.content_key)
            .finish()
    }
}
