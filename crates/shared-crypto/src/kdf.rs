//! # Key Derivation
//!
//! - HMAC-SHA256 (RFC 2104)
//! - HKDF-SHA256 (RFC 5869)
//! - Session keys: `truncate128(HMAC-SHA256(secret, nonce || slot_be))`

use crate::symmetric::{SymmetricKey, KEY_LEN};
use crate::CryptoError;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Maximum HKDF output accepted here.
const MAX_HKDF_OUTPUT: usize = 64;

/// Computes HMAC-SHA256 over `data` using `key`.
///
/// # Errors
///
/// Returns `CryptoError::InvalidInput` if HMAC initialisation fails.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidInput(format!("HMAC key init failed: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Fills `output` with HKDF-SHA256 key material.
///
/// # Errors
///
/// Returns `CryptoError::InvalidInput` if `output` is empty or longer than
/// 64 bytes.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    if output.is_empty() || output.len() > MAX_HKDF_OUTPUT {
        return Err(CryptoError::InvalidInput(format!(
            "HKDF output length {} out of range",
            output.len()
        )));
    }
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, output)
        .map_err(|e| CryptoError::InvalidInput(format!("HKDF expand failed: {e}")))
}

/// Derive the 128-bit session key for a `(nonce, time slot)` pair.
///
/// Both sides of a session compute the same key from the shared secret,
/// so the server never stores per-session keys.
///
/// # Errors
///
/// Returns `CryptoError::InvalidInput` if `secret` is empty.
pub fn derive_session_key(
    secret: &[u8],
    nonce: &[u8; 16],
    time_slot: u64,
) -> Result<SymmetricKey, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::InvalidInput("empty session secret".into()));
    }
    let mut data = [0u8; 24];
    data[..16].copy_from_slice(nonce);
    data[16..].copy_from_slice(&time_slot.to_be_bytes());

    let mut digest = hmac_sha256(secret, &data)?;
    let mut truncated = [0u8; KEY_LEN];
    truncated.copy_from_slice(&digest[..KEY_LEN]);
    digest.zeroize();

    let key = SymmetricKey::from_bytes(truncated);
    truncated.zeroize();
    Ok(key)
}
