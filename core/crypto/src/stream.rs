//! Streaming encryption for large files.
//!
//! Data is processed in fixed-size chunks so that peak memory stays at one
//! chunk regardless of file size. Each chunk is sealed with
//! XChaCha20-Poly1305 under the file's content key.
//!
//! # Format
//! - Header: version (1) + chunk_size (4, LE) + nonce prefix (16)
//! - Chunks: ciphertext || tag, one per `chunk_size` plaintext bytes
//!
//! The nonce of chunk `i` is `prefix || i` (u64 LE). The associated data of
//! every chunk is the header followed by a final-chunk flag, so reordering,
//! truncation, appended data and header edits all fail authentication. An
//! empty input is encoded as a single empty final chunk.

use std::io::{self, Read, Write};

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::aead::{decrypt_with_nonce, encrypt_with_nonce, NONCE_SIZE, TAG_SIZE};
use crate::keys::ContentKey;
use hidevault_common::{Error, Result};

/// Default chunk size for streaming encryption (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size accepted from a header (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Stream encryption version.
pub const STREAM_VERSION: u8 = 2;

/// Length of the random per-stream nonce prefix.
pub const NONCE_PREFIX_SIZE: usize = NONCE_SIZE - 8;

/// Header size: version (1) + chunk_size (4) + nonce prefix (16).
pub const HEADER_SIZE: usize = 1 + 4 + NONCE_PREFIX_SIZE;

/// Byte counts of one encryption pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Plaintext bytes read from the source.
    pub plaintext_len: u64,
    /// Ciphertext bytes written, header included.
    pub ciphertext_len: u64,
}

/// Chunked authenticated cipher for file contents.
#[derive(Debug, Clone, Copy)]
pub struct FileCipher {
    chunk_size: usize,
}

impl Default for FileCipher {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl FileCipher {
    /// Create a cipher with the default chunk size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom chunk size.
    ///
    /// # Errors
    /// - Returns error if size is zero or above [`MAX_CHUNK_SIZE`]
    pub fn with_chunk_size(size: usize) -> Result<Self> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "Chunk size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        Ok(Self { chunk_size: size })
    }

    /// Plaintext bytes per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Ciphertext length for a plaintext of `plaintext_len` bytes.
    pub fn encrypted_len(&self, plaintext_len: u64) -> u64 {
        let chunk = self.chunk_size as u64;
        let chunks = if plaintext_len == 0 {
            1
        } else {
            plaintext_len.div_ceil(chunk)
        };
        HEADER_SIZE as u64 + plaintext_len + chunks * TAG_SIZE as u64
    }

    /// Encrypt data from reader and write to writer.
    ///
    /// # Postconditions
    /// - All data is encrypted and authenticated
    /// - Returns plaintext and ciphertext byte counts
    ///
    /// # Errors
    /// - I/O errors from reader/writer
    pub fn encrypt<R: Read, W: Write>(
        &self,
        key: &ContentKey,
        mut reader: R,
        mut writer: W,
    ) -> Result<StreamStats> {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng.fill_bytes(&mut prefix);

        let header = encode_header(self.chunk_size, &prefix);
        writer.write_all(&header)?;

        let mut stats = StreamStats {
            plaintext_len: 0,
            ciphertext_len: HEADER_SIZE as u64,
        };

        // One byte of look-ahead tells whether the current chunk is the last.
        let mut buffer = Zeroizing::new(Vec::with_capacity(self.chunk_size + 1));
        fill(&mut reader, &mut buffer, self.chunk_size + 1)?;

        let mut index = 0u64;
        loop {
            let is_last = buffer.len() <= self.chunk_size;
            let take = buffer.len().min(self.chunk_size);

            let sealed = encrypt_with_nonce(
                key.as_bytes(),
                &chunk_nonce(&prefix, index),
                &buffer[..take],
                &chunk_aad(&header, is_last),
            )?;
            writer.write_all(&sealed)?;

            stats.plaintext_len += take as u64;
            stats.ciphertext_len += sealed.len() as u64;

            if is_last {
                break;
            }

            buffer.drain(..take);
            fill(&mut reader, &mut buffer, self.chunk_size + 1)?;
            index += 1;
        }

        writer.flush()?;
        Ok(stats)
    }

    /// Decrypt data from reader and write to writer.
    ///
    /// # Postconditions
    /// - Original plaintext is recovered, all chunks authenticated
    /// - Returns the number of plaintext bytes written
    ///
    /// # Errors
    /// - `Error::Corrupted` for wrong key, bad header, truncated, reordered
    ///   or tampered data
    /// - I/O errors
    ///
    /// Plaintext of chunks before a corrupted chunk has already been written
    /// when an error is returned; callers discard the sink on error.
    pub fn decrypt<R: Read, W: Write>(
        &self,
        key: &ContentKey,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Corrupted("Ciphertext header truncated".to_string())
            } else {
                Error::Io(e)
            }
        })?;

        let (chunk_size, prefix) = decode_header(&header)?;
        let sealed_size = chunk_size + TAG_SIZE;

        let mut buffer = Vec::with_capacity(sealed_size + 1);
        fill(&mut reader, &mut buffer, sealed_size + 1)?;

        let mut total = 0u64;
        let mut index = 0u64;
        loop {
            let is_last = buffer.len() <= sealed_size;
            let take = buffer.len().min(sealed_size);
            if take < TAG_SIZE {
                return Err(Error::Corrupted("Ciphertext truncated".to_string()));
            }

            let plaintext = Zeroizing::new(decrypt_with_nonce(
                key.as_bytes(),
                &chunk_nonce(&prefix, index),
                &buffer[..take],
                &chunk_aad(&header, is_last),
            )?);
            writer.write_all(&plaintext)?;
            total += plaintext.len() as u64;

            if is_last {
                break;
            }

            buffer.drain(..take);
            fill(&mut reader, &mut buffer, sealed_size + 1)?;
            index += 1;
        }

        writer.flush()?;
        Ok(total)
    }
}

fn encode_header(chunk_size: usize, prefix: &[u8; NONCE_PREFIX_SIZE]) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = STREAM_VERSION;
    header[1..5].copy_from_slice(&(chunk_size as u32).to_le_bytes());
    header[5..].copy_from_slice(prefix);
    header
}

fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(usize, [u8; NONCE_PREFIX_SIZE])> {
    if header[0] != STREAM_VERSION {
        return Err(Error::Corrupted(format!(
            "Unsupported stream version: {}",
            header[0]
        )));
    }

    let mut size_bytes = [0u8; 4];
    size_bytes.copy_from_slice(&header[1..5]);
    let chunk_size = u32::from_le_bytes(size_bytes) as usize;
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::Corrupted(format!(
            "Invalid chunk size in header: {}",
            chunk_size
        )));
    }

    let mut prefix = [0u8; NONCE_PREFIX_SIZE];
    prefix.copy_from_slice(&header[5..]);
    Ok((chunk_size, prefix))
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&index.to_le_bytes());
    nonce
}

fn chunk_aad(header: &[u8; HEADER_SIZE], is_last: bool) -> [u8; HEADER_SIZE + 1] {
    let mut aad = [0u8; HEADER_SIZE + 1];
    aad[..HEADER_SIZE].copy_from_slice(header);
    aad[HEADER_SIZE] = u8::from(is_last);
    aad
}

/// Read until `buffer` holds `want` bytes or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buffer: &mut Vec<u8>, want: usize) -> Result<()> {
    let mut chunk = [0u8; 8192];
    while buffer.len() < want {
        let room = (want - buffer.len()).min(chunk.len());
        match reader.read(&mut chunk[..room]) {
            Ok(0) => break,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    zeroize::Zeroize::zeroize(&mut chunk);
    Ok(())
}

/// Encrypt a complete byte slice using streaming encryption.
///
/// This is a convenience function for when the complete data is available.
pub fn encrypt_bytes(key: &ContentKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    FileCipher::new().encrypt(key, data, &mut output)?;
    Ok(output)
}

/// Decrypt a complete byte slice that was encrypted with streaming encryption.
pub fn decrypt_bytes(key: &ContentKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    FileCipher::new().decrypt(key, data, &mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;
    use proptest::prelude::*;

    fn key(byte: u8) -> ContentKey {
        ContentKey::from_bytes([byte; KEY_LENGTH])
    }

    #[test]
    fn test_stream_encrypt_decrypt_roundtrip() {
        let plaintext = b"Hello, streaming encryption!";

        let encrypted = encrypt_bytes(&key(42), plaintext).unwrap();
        let decrypted = decrypt_bytes(&key(42), &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_stream_multiple_chunks() {
        let plaintext = vec![0xAB; DEFAULT_CHUNK_SIZE * 3 + 1000];

        let encrypted = encrypt_bytes(&key(42), &plaintext).unwrap();
        let decrypted = decrypt_bytes(&key(42), &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_stream_exact_chunk_multiple() {
        let cipher = FileCipher::with_chunk_size(16).unwrap();
        let plaintext = vec![7u8; 64];

        let mut encrypted = Vec::new();
        let stats = cipher.encrypt(&key(1), &plaintext[..], &mut encrypted).unwrap();
        assert_eq!(stats.plaintext_len, 64);
        assert_eq!(stats.ciphertext_len, encrypted.len() as u64);
        assert_eq!(stats.ciphertext_len, cipher.encrypted_len(64));

        let mut decrypted = Vec::new();
        let n = cipher.decrypt(&key(1), &encrypted[..], &mut decrypted).unwrap();
        assert_eq!(n, 64);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_stream_empty_data() {
        let encrypted = encrypt_bytes(&key(42), b"").unwrap();
        assert_eq!(encrypted.len(), HEADER_SIZE + TAG_SIZE);

        let decrypted = decrypt_bytes(&key(42), &encrypted).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_stream_wrong_key_fails() {
        let encrypted = encrypt_bytes(&key(1), b"Secret streaming data").unwrap();
        let err = decrypt_bytes(&key(2), &encrypted).unwrap_err();

        assert!(err.is_corrupted());
    }

    #[test]
    fn test_stream_truncation_at_chunk_boundary_detected() {
        let cipher = FileCipher::with_chunk_size(16).unwrap();
        let plaintext = vec![3u8; 48];
        let mut encrypted = Vec::new();
        cipher.encrypt(&key(9), &plaintext[..], &mut encrypted).unwrap();

        // Drop the final chunk: the previous chunk was sealed as non-final.
        let cut = HEADER_SIZE + 2 * (16 + TAG_SIZE);
        let mut out = Vec::new();
        let err = cipher.decrypt(&key(9), &encrypted[..cut], &mut out).unwrap_err();
        assert!(err.is_corrupted());
    }

    #[test]
    fn test_stream_truncated_header_is_corruption() {
        let encrypted = encrypt_bytes(&key(4), b"data").unwrap();
        let err = decrypt_bytes(&key(4), &encrypted[..HEADER_SIZE - 3]).unwrap_err();
        assert!(err.is_corrupted());
    }

    #[test]
    fn test_stream_appended_data_detected() {
        let mut encrypted = encrypt_bytes(&key(4), b"data").unwrap();
        encrypted.extend_from_slice(&[0u8; 40]);
        assert!(decrypt_bytes(&key(4), &encrypted).is_err());
    }

    #[test]
    fn test_stream_reordered_chunks_detected() {
        let cipher = FileCipher::with_chunk_size(8).unwrap();
        let plaintext: Vec<u8> = (0u8..32).collect();
        let mut encrypted = Vec::new();
        cipher.encrypt(&key(5), &plaintext[..], &mut encrypted).unwrap();

        let sealed = 8 + TAG_SIZE;
        let first = HEADER_SIZE..HEADER_SIZE + sealed;
        let second = HEADER_SIZE + sealed..HEADER_SIZE + 2 * sealed;
        let mut swapped = encrypted.clone();
        swapped[first.clone()].copy_from_slice(&encrypted[second.clone()]);
        swapped[second].copy_from_slice(&encrypted[first]);

        let mut out = Vec::new();
        assert!(cipher.decrypt(&key(5), &swapped[..], &mut out).unwrap_err().is_corrupted());
    }

    #[test]
    fn test_stream_header_tampering_detected() {
        let mut encrypted = encrypt_bytes(&key(6), b"header bound").unwrap();
        encrypted[HEADER_SIZE - 1] ^= 0x80;
        assert!(decrypt_bytes(&key(6), &encrypted).unwrap_err().is_corrupted());

        let mut bad_version = encrypt_bytes(&key(6), b"header bound").unwrap();
        bad_version[0] = 1;
        assert!(decrypt_bytes(&key(6), &bad_version).unwrap_err().is_corrupted());
    }

    #[test]
    fn test_stream_header_format() {
        let encrypted = encrypt_bytes(&key(42), b"Test").unwrap();

        assert_eq!(encrypted[0], STREAM_VERSION);
        let chunk_size = u32::from_le_bytes(encrypted[1..5].try_into().unwrap());
        assert_eq!(chunk_size as usize, DEFAULT_CHUNK_SIZE);
        assert_eq!(encrypted.len(), HEADER_SIZE + 4 + TAG_SIZE);
    }

    #[test]
    fn test_invalid_chunk_size() {
        assert!(FileCipher::with_chunk_size(0).is_err());
        assert!(FileCipher::with_chunk_size(MAX_CHUNK_SIZE + 1).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_roundtrip_preserves_bytes_and_length(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            chunk in 1usize..300,
        ) {
            let cipher = FileCipher::with_chunk_size(chunk).unwrap();
            let mut encrypted = Vec::new();
            let stats = cipher.encrypt(&key(11), &data[..], &mut encrypted).unwrap();
            prop_assert_eq!(stats.plaintext_len, data.len() as u64);
            prop_assert_eq!(stats.ciphertext_len, cipher.encrypted_len(data.len() as u64));

            let mut decrypted = Vec::new();
            cipher.decrypt(&key(11), &encrypted[..], &mut decrypted).unwrap();
            prop_assert_eq!(decrypted, data);
        }
    }
}
