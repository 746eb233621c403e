//! Cryptographic primitives for hidevault.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Folder password authentication with constant-time verification
//! - Content key wrapping under a password-derived wrapping key
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Chunked streaming encryption for file contents
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod auth;
pub mod kdf;
pub mod keys;
pub mod stream;
pub mod wrap;

pub use auth::PasswordAuthenticator;
pub use kdf::{derive_key, KdfParams};
pub use keys::{ContentKey, MasterKey, PasswordHash, Salt, WrappedKey, WrappingKey};
pub use stream::{decrypt_bytes, encrypt_bytes, FileCipher, StreamStats};
pub use wrap::KeyWrapper;
