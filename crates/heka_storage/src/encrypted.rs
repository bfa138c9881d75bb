//! Encrypted key-value backend wrapper.
//!
//! Credentials and checkpoints are secrets at rest. This module wraps any
//! other backend and encrypts every value with AES-256-GCM.
//!
//! ## Security Model
//!
//! - Each value is encrypted independently with a fresh random nonce
//! - Value layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//! - The key name is bound as associated data, so a ciphertext moved to a
//!   different key fails authentication
//! - Key names are stored in plaintext
//! - Keys are never stored; they must be provided by the application

use crate::backend::{BatchOp, KvBackend, WriteBatch};
use crate::error::{StorageError, StorageResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for the encrypted backend.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::Encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a high-entropy passphrase using HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns an error if key expansion fails.
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> StorageResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"heka-store-key-v1", &mut bytes)
            .map_err(|_| StorageError::Encryption("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    /// Returns the key as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A backend that encrypts every value before handing it to `inner`.
///
/// # Example
///
/// ```rust
/// use heka_storage::{EncryptedBackend, EncryptionKey, InMemoryBackend, KvBackend};
///
/// let backend = EncryptedBackend::new(InMemoryBackend::new(), EncryptionKey::generate());
/// backend.put("credentials", b"api-key").unwrap();
/// assert_eq!(backend.get("credentials").unwrap(), Some(b"api-key".to_vec()));
/// ```
pub struct EncryptedBackend<B: KvBackend> {
    inner: B,
    cipher: Aes256Gcm,
}

impl<B: KvBackend> EncryptedBackend<B> {
    /// Creates a new encrypted backend wrapping `inner`.
    #[must_use]
    pub fn new(inner: B, key: EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { inner, cipher }
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn encrypt(&self, key: &str, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::Encryption("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &str, data: &[u8]) -> StorageResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StorageError::Encryption("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::Encryption(format!("authentication failed for {key}")))
    }
}

impl<B: KvBackend> KvBackend for EncryptedBackend<B> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.inner.get(key)? {
            Some(data) => self.decrypt(key, &data).map(Some),
            None => Ok(None),
        }
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut sealed = WriteBatch::new();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    let encrypted = self.encrypt(&key, &value)?;
                    sealed.put(key, encrypted);
                }
                BatchOp::Delete { key } => {
                    sealed.delete(key);
                }
            }
        }
        self.inner.write_batch(sealed)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }
}
