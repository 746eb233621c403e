//! Common types used throughout hidevault.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a password-protected folder.
///
/// Ids are assigned by the metadata repository and carry no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(i64);

impl FolderId {
    /// Wrap a repository-assigned id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FolderId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|_| crate::Error::InvalidInput(format!("Invalid folder id: {}", s)))
    }
}

/// Identifier of an encrypted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(i64);

impl FileId {
    /// Wrap a repository-assigned id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|_| crate::Error::InvalidInput(format!("Invalid file id: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_folder_id_parse() {
        let id: FolderId = "42".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<FolderId>().is_err());
    }

    #[test]
    fn test_file_id_parse() {
        let id: FileId = "7".parse().unwrap();
        assert_eq!(id, FileId::new(7));
        assert!("".parse::<FileId>().is_err());
    }

    proptest! {
        #[test]
        fn prop_file_id_display_parse(raw in any::<i64>()) {
            let id = FileId::new(raw);
            let parsed: FileId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
