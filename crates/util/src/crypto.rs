//! AES-256-GCM encryption for credential values at rest.
//!
//! The stored form is base64 of `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! Encryption and decryption are local computation only.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use thiserror::Error;

/// Size of the AES-256-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;
/// Size of the authentication tag appended by AES-GCM.
const TAG_SIZE: usize = 16;
/// Required master key length.
pub const KEY_SIZE: usize = 32;

/// Errors raised while encrypting or decrypting a secret.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid encrypted data: too short")]
    InvalidEncryptedData,
}

/// Symmetric cipher keyed by the process-wide master key.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher(<redacted>)")
    }
}

impl SecretCipher {
    /// Build a cipher from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CipherError::EncryptionFailed(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Build a cipher from a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKeyEncoding(e.to_string()))?;
        Self::new(&key)
    }

    /// Generate a fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    /// Encrypt `plaintext` with a random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::EncryptionFailed(e.to_string()))?;

        let mut encrypted = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        encrypted.extend_from_slice(&nonce_bytes);
        encrypted.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(encrypted))
    }

    /// Decrypt a value produced by [`SecretCipher::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let encrypted = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::DecryptionFailed(e.to_string()))?;
        if encrypted.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::InvalidEncryptedData);
        }

        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|e| CipherError::DecryptionFailed(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CipherError::DecryptionFailed(e.to_string()))
    }
}
