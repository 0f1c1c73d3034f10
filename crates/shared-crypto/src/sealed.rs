//! # Sealed Boxes
//!
//! Anonymous public-key encryption to an X25519 key.
//!
//! ```text
//! sender:    eph = random X25519 key
//!            k   = HKDF-SHA256(ikm = DH(eph, recipient), salt = eph_pk || recipient_pk)
//!            ct  = ChaCha20-Poly1305(k, random nonce, plaintext)
//!            send (eph_pk, nonce, ct)
//! recipient: k   = HKDF-SHA256(DH(recipient_sk, eph_pk), same salt)
//! ```
//!
//! The ephemeral key is discarded after sealing, so only the holder of the
//! recipient's secret can open the box.

use crate::kdf::hkdf_sha256;
use crate::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use zeroize::Zeroize;

const SEALED_BOX_INFO: &[u8] = b"meshbus-sealed-box-v1";
const NONCE_LEN: usize = 12;

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey([u8; 32]);

impl X25519PublicKey {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Long-lived X25519 keypair. The secret is zeroized on drop.
pub struct X25519KeyPair {
    secret: x25519_dalek::StaticSecret,
    public: X25519PublicKey,
}

impl X25519KeyPair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        Self::from_secret(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    /// Restore from a 32-byte secret.
    pub fn from_seed(mut seed: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(seed);
        seed.zeroize();
        Self::from_secret(secret)
    }

    fn from_secret(secret: x25519_dalek::StaticSecret) -> Self {
        let public = X25519PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// The public half.
    pub fn public_key(&self) -> X25519PublicKey {
        self.public
    }
}

/// An encrypted message for one recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedBox {
    /// Sender's ephemeral public key.
    pub ephemeral_public: [u8; 32],
    /// AEAD nonce.
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with tag.
    pub ciphertext: Vec<u8>,
}

fn box_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);
    let mut key = [0u8; 32];
    hkdf_sha256(shared, &salt, SEALED_BOX_INFO, &mut key)?;
    Ok(key)
}

/// Encrypt `plaintext` so that only `recipient` can read it.
///
/// # Errors
///
/// Returns `CryptoError::KeyAgreementFailed` for a low-order recipient key.
pub fn seal(recipient: &X25519PublicKey, plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
    let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral).to_bytes();

    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreementFailed);
    }

    let mut key = box_key(shared.as_bytes(), &ephemeral_public, &recipient.0)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

    let result = ChaCha20Poly1305::new((&key).into())
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()));
    key.zeroize();

    Ok(SealedBox {
        ephemeral_public,
        nonce,
        ciphertext: result?,
    })
}

/// Open a box sealed to `recipient`'s public key.
///
/// # Errors
///
/// Returns `CryptoError::DecryptionFailed` if the box was not sealed to this
/// key or was modified.
pub fn open_sealed(recipient: &X25519KeyPair, sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
    let shared = recipient
        .secret
        .diffie_hellman(&x25519_dalek::PublicKey::from(sealed.ephemeral_public));
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreementFailed);
    }

    let mut key = box_key(
        shared.as_bytes(),
        &sealed.ephemeral_public,
        recipient.public.as_bytes(),
    )?;
    let result = ChaCha20Poly1305::new((&key).into())
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed);
    key.zeroize();
    result
}
