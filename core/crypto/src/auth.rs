//! Folder password authentication.
//!
//! A folder stores a random salt and a one-way hash of its password. The hash
//! is only a membership test: it is derived from the same Argon2id output as
//! the wrapping key but through a separate BLAKE2b context, so knowing it
//! does not help recover any content key.

use subtle::ConstantTimeEq;

use crate::kdf::{derive_key, KdfParams};
use crate::keys::{MasterKey, PasswordHash, Salt};
use hidevault_common::Result;

/// Hashes and verifies folder passwords with a fixed set of KDF parameters.
#[derive(Debug, Clone, Copy)]
pub struct PasswordAuthenticator {
    params: KdfParams,
}

impl PasswordAuthenticator {
    /// Create an authenticator for the given KDF parameters.
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// KDF parameters in use.
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Generate a fresh folder salt from the OS CSPRNG.
    pub fn generate_salt() -> Salt {
        Salt::generate()
    }

    /// Hash a password against a salt.
    ///
    /// Deterministic for the same (password, salt, params).
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the password is empty
    pub fn hash(&self, password: &[u8], salt: &Salt) -> Result<PasswordHash> {
        Ok(self.derive_master(password, salt)?.password_hash())
    }

    /// Run the password KDF once.
    ///
    /// Callers that need both the verification and the wrapping key derive
    /// the master once and use [`Self::verify_master`].
    pub fn derive_master(&self, password: &[u8], salt: &Salt) -> Result<MasterKey> {
        derive_key(password, salt, &self.params)
    }

    /// Verify a candidate password against stored credentials.
    ///
    /// # Returns
    /// - `Ok(true)` if the password is correct
    /// - `Ok(false)` if the password is wrong
    ///
    /// # Errors
    /// - `Error::Corrupted` if the stored salt or hash is malformed
    pub fn verify(&self, password: &[u8], salt: &[u8], expected_hash: &[u8]) -> Result<bool> {
        let salt = Salt::from_slice(salt)?;
        let expected = PasswordHash::from_slice(expected_hash)?;
        let master = self.derive_master(password, &salt)?;
        Ok(Self::matches(&master, &expected))
    }

    /// Verify an already derived master key against a stored hash.
    ///
    /// # Errors
    /// - `Error::Corrupted` if the stored hash is malformed
    pub fn verify_master(master: &MasterKey, expected_hash: &[u8]) -> Result<bool> {
        let expected = PasswordHash::from_slice(expected_hash)?;
        Ok(Self::matches(master, &expected))
    }

    fn matches(master: &MasterKey, expected: &PasswordHash) -> bool {
        let computed = master.password_hash();
        computed.as_bytes().ct_eq(expected.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn authenticator() -> PasswordAuthenticator {
        PasswordAuthenticator::new(KdfParams {
            memory_cost: 256,
            time_cost: 1,
            parallelism: 1,
        })
    }

    #[test]
    fn test_hash_deterministic() {
        let auth = authenticator();
        let salt = Salt::from_bytes([9u8; 32]);

        let h1 = auth.hash(b"abcd1234", &salt).unwrap();
        let h2 = auth.hash(b"abcd1234", &salt).unwrap();
        assert_eq!(h1, h2);

        let other_salt = Salt::from_bytes([10u8; 32]);
        assert_ne!(h1, auth.hash(b"abcd1234", &other_salt).unwrap());
    }

    #[test]
    fn test_verify_correct_and_wrong() {
        let auth = authenticator();
        let salt = PasswordAuthenticator::generate_salt();
        let hash = auth.hash(b"abcd1234", &salt).unwrap();

        assert!(auth.verify(b"abcd1234", salt.as_bytes(), hash.as_bytes()).unwrap());
        assert!(!auth.verify(b"wrong", salt.as_bytes(), hash.as_bytes()).unwrap());
    }

    #[test]
    fn test_corrupted_credentials_are_structural_errors() {
        let auth = authenticator();
        let salt = PasswordAuthenticator::generate_salt();
        let hash = auth.hash(b"pw", &salt).unwrap();

        let err = auth.verify(b"pw", &salt.as_bytes()[..8], hash.as_bytes()).unwrap_err();
        assert!(err.is_corrupted());

        let err = auth.verify(b"pw", salt.as_bytes(), &hash.as_bytes()[..31]).unwrap_err();
        assert!(err.is_corrupted());
    }

    #[test]
    fn test_verify_master() {
        let auth = authenticator();
        let salt = PasswordAuthenticator::generate_salt();
        let hash = auth.hash(b"secret", &salt).unwrap();

        let master = auth.derive_master(b"secret", &salt).unwrap();
        assert!(PasswordAuthenticator::verify_master(&master, hash.as_bytes()).unwrap());

        let wrong = auth.derive_master(b"Secret", &salt).unwrap();
        assert!(!PasswordAuthenticator::verify_master(&wrong, hash.as_bytes()).unwrap());
    }

    #[test]
    fn test_empty_password_rejected() {
        let auth = authenticator();
        assert!(auth.hash(b"", &Salt::generate()).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_verify_accepts_only_the_hashed_password(
            password in proptest::collection::vec(any::<u8>(), 1..32),
            other in proptest::collection::vec(any::<u8>(), 1..32),
        ) {
            let auth = authenticator();
            let salt = PasswordAuthenticator::generate_salt();
            let hash = auth.hash(&password, &salt).unwrap();

            prop_assert!(auth.verify(&password, salt.as_bytes(), hash.as_bytes()).unwrap());
            if other != password {
                prop_assert!(!auth.verify(&other, salt.as_bytes(), hash.as_bytes()).unwrap());
            }
        }
    }
}
