//! # SHA-256 Hashing
//!
//! Digests used for certificate fingerprints in logs.

use sha2::{Digest, Sha256};

/// SHA-256 output (256-bit).
pub type Hash = [u8; 32];

/// Hash data with SHA-256 (one-shot).
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Short hex fingerprint (first 8 bytes of the SHA-256 digest).
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(&sha256(data)[..8])
}
