//! # Shared Crypto - Secure Channel Primitives
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `symmetric` | AES-128-GCM | Session payloads, key responses |
//! | `sealed` | X25519 + HKDF-SHA256 + ChaCha20-Poly1305 | Encrypting to a certificate's public key |
//! | `kdf` | HMAC-SHA256, HKDF-SHA256 | Session key derivation |
//! | `signatures` | Ed25519 | Certificate signing |
//! | `hashing` | SHA-256 | Fingerprints |
//!
//! ## Security Properties
//!
//! - Secret key material is zeroized on drop and never implements `Debug`.
//! - All ciphers are AEAD; tampering fails decryption.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod errors;
pub mod hashing;
pub mod kdf;
pub mod sealed;
pub mod signatures;
pub mod symmetric;

// Re-exports
pub use errors::CryptoError;
pub use hashing::{fingerprint, sha256};
pub use kdf::{derive_session_key, hkdf_sha256, hmac_sha256};
pub use sealed::{open_sealed, seal, SealedBox, X25519KeyPair, X25519PublicKey};
pub use signatures::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};
pub use symmetric::{decrypt, encrypt, Iv, SymmetricKey, IV_LEN, KEY_LEN};
