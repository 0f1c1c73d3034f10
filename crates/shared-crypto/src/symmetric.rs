//! # Symmetric Encryption
//!
//! AES-128-GCM with caller-supplied IV and associated data.
//!
//! ## Security Properties
//!
//! - 128-bit keys, 96-bit IVs, 128-bit authentication tag
//! - An (key, IV) pair must never encrypt two different plaintexts;
//!   use [`Iv::generate`] per message

use crate::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};
use zeroize::Zeroize;

/// Key length in bytes.
pub const KEY_LEN: usize = 16;

/// IV length in bytes.
pub const IV_LEN: usize = 12;

/// Secret key (128-bit).
#[derive(Clone, Zeroize, PartialEq, Eq)]
#[zeroize(drop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice of exactly [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Generate random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Get inner bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Initialization vector for AES-GCM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Iv([u8; IV_LEN]);

impl Iv {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice of exactly [`IV_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; IV_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!("IV must be {} bytes, got {}", IV_LEN, bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Generate random IV.
    pub fn generate() -> Self {
        let mut bytes = [0u8; IV_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Get inner bytes.
    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

/// Encrypt `plaintext`, binding `aad` into the tag.
///
/// # Errors
///
/// Returns `CryptoError::EncryptionFailed` if encryption fails.
pub fn encrypt(
    key: &SymmetricKey,
    iv: &Iv,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(key.as_bytes().into());
    cipher
        .encrypt(
            Nonce::from_slice(iv.as_bytes()),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Decrypt `ciphertext` produced by [`encrypt`] with the same key, IV and aad.
///
/// # Errors
///
/// Returns `CryptoError::DecryptionFailed` on any mismatch or tampering.
pub fn decrypt(
    key: &SymmetricKey,
    iv: &Iv,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(iv.as_bytes()),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}
