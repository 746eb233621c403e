//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hidevault_common::{Error, Result};
use hidevault_crypto::stream::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use hidevault_crypto::KdfParams;

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "hidevault.json";

/// Blob area directory name under a root.
pub const BLOBS_DIRNAME: &str = "blobs";

/// Scratch directory name under a root.
pub const SCRATCH_DIRNAME: &str = "scratch";

/// Metadata database file name under a root.
pub const METADATA_FILENAME: &str = "metadata.db";

/// Paths and tuning knobs of a vault engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding encrypted blobs.
    pub storage_root: PathBuf,
    /// Directory for decrypted temporary copies. Must not lie inside
    /// `storage_root`.
    pub scratch_dir: PathBuf,
    /// SQLite metadata database.
    pub metadata_path: PathBuf,
    /// KDF parameters for new folders and password changes.
    #[serde(default)]
    pub kdf_params: KdfParams,
    /// Plaintext bytes per encrypted chunk for new files.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Deadline for each metadata repository call, if any.
    #[serde(default)]
    pub repository_timeout_ms: Option<u64>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl EngineConfig {
    /// Configuration with every path under `root`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            storage_root: root.join(BLOBS_DIRNAME),
            scratch_dir: root.join(SCRATCH_DIRNAME),
            metadata_path: root.join(METADATA_FILENAME),
            kdf_params: KdfParams::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            repository_timeout_ms: None,
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// - I/O failure reading the file
    /// - `Error::Serialization` if the JSON is malformed
    /// - Any error from [`Self::validate`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Serialization(format!("Invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Repository deadline as a `Duration`.
    pub fn repository_timeout(&self) -> Option<Duration> {
        self.repository_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration for consistency.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for empty paths, a scratch directory inside
    ///   the storage root, a chunk size out of range or a zero timeout
    /// - `Error::Crypto` for KDF parameters Argon2id rejects
    pub fn validate(&self) -> Result<()> {
        for (label, path) in [
            ("storage_root", &self.storage_root),
            ("scratch_dir", &self.scratch_dir),
            ("metadata_path", &self.metadata_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidInput(format!("{} is empty", label)));
            }
        }

        if self.scratch_dir.starts_with(&self.storage_root)
            || self.storage_root.starts_with(&self.scratch_dir)
        {
            return Err(Error::InvalidInput(
                "scratch_dir and storage_root must not contain each other".to_string(),
            ));
        }

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "chunk_size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }

        if self.repository_timeout_ms == Some(0) {
            return Err(Error::InvalidInput(
                "repository_timeout_ms must be positive".to_string(),
            ));
        }

        self.kdf_params.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_with_root_is_valid() {
        let config = EngineConfig::with_root("/data/hidevault");

        assert_eq!(config.storage_root, Path::new("/data/hidevault/blobs"));
        assert_eq!(config.scratch_dir, Path::new("/data/hidevault/scratch"));
        assert_eq!(config.kdf_params, KdfParams::moderate());
        config.validate().unwrap();
    }

    #[test]
    fn test_scratch_inside_storage_rejected() {
        let mut config = EngineConfig::with_root("/data/hidevault");
        config.scratch_dir = config.storage_root.join("tmp");

        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_bad_tuning_rejected() {
        let mut config = EngineConfig::with_root("/data");
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_root("/data");
        config.repository_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_root("/data");
        config.kdf_params.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);

        let mut config = EngineConfig::with_root(temp.path());
        config.repository_timeout_ms = Some(2500);
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.repository_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_load_defaults_optional_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(
            &path,
            r#"{"storage_root":"/v/blobs","scratch_dir":"/v/scratch","metadata_path":"/v/m.db"}"#,
        )
        .unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(loaded.kdf_params, KdfParams::default());
        assert_eq!(loaded.repository_timeout_ms, None);
    }

    #[test]
    fn test_load_malformed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            EngineConfig::load(&path),
            Err(Error::Serialization(_))
        ));
    }
}
