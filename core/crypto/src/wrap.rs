//! Content key wrapping.
//!
//! Every file gets its own random content key. The key is stored only in
//! wrapped form: encrypted with XChaCha20-Poly1305 under the owning folder's
//! wrapping key, which is derived from the folder password and never stored.

use crate::aead::{decrypt_with_aad, encrypt_with_aad, NONCE_SIZE, TAG_SIZE};
use crate::kdf::{derive_key, KdfParams};
use crate::keys::{ContentKey, Salt, WrappedKey, WrappingKey, KEY_LENGTH};
use hidevault_common::{Error, Result};

/// Associated data binding wrapped blobs to their purpose.
const WRAP_AAD: &[u8] = b"hidevault/content-key/v1";

/// Length of a wrapped content key: nonce + key + tag.
pub const WRAPPED_KEY_LENGTH: usize = NONCE_SIZE + KEY_LENGTH + TAG_SIZE;

/// Wraps and unwraps per-file content keys.
pub struct KeyWrapper;

impl KeyWrapper {
    /// Derive the wrapping key for a folder from its password and salt.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the password is empty
    /// - `Error::Crypto` if the KDF parameters are invalid
    pub fn derive_wrapping_key(
        password: &[u8],
        salt: &Salt,
        params: &KdfParams,
    ) -> Result<WrappingKey> {
        Ok(derive_key(password, salt, params)?.wrapping_key())
    }

    /// Encrypt a content key under a wrapping key.
    pub fn wrap(content_key: &ContentKey, wrapping_key: &WrappingKey) -> Result<WrappedKey> {
        let blob = encrypt_with_aad(wrapping_key.as_bytes(), content_key.as_bytes(), WRAP_AAD)?;
        Ok(WrappedKey::from_bytes(blob))
    }

    /// Recover a content key.
    ///
    /// # Errors
    /// - `Error::Corrupted` if the blob has the wrong size or does not
    ///   authenticate under `wrapping_key` (wrong key or tampered blob)
    pub fn unwrap(wrapped: &WrappedKey, wrapping_key: &WrappingKey) -> Result<ContentKey> {
        let blob = wrapped.as_bytes();
        if blob.len() != WRAPPED_KEY_LENGTH {
            return Err(Error::Corrupted(format!(
                "Wrapped key has {} bytes, expected {}",
                blob.len(),
                WRAPPED_KEY_LENGTH
            )));
        }

        let mut plain = decrypt_with_aad(wrapping_key.as_bytes(), blob, WRAP_AAD)
            .map_err(|_| Error::Corrupted("Content key failed to unwrap".to_string()))?;

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&plain);
        zeroize::Zeroize::zeroize(&mut plain);

        let content_key = ContentKey::from_bytes(key);
        zeroize::Zeroize::zeroize(&mut key);
        Ok(content_key)
    }

    /// Move a wrapped key from one wrapping key to another.
    pub fn rewrap(
        wrapped: &WrappedKey,
        old_key: &WrappingKey,
        new_key: &WrappingKey,
    ) -> Result<WrappedKey> {
        let content_key = Self::unwrap(wrapped, old_key)?;
        Self::wrap(&content_key, new_key)
    }
}
