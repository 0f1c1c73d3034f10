//! Service certificates.
//!
//! A certificate binds a subject to the X25519 key clients seal key requests
//! to, plus a claim listing the service addresses the holder may serve. It is
//! signed by an issuing authority's Ed25519 key.
//!
//! | Check | Failure code |
//! |-------|--------------|
//! | Signature verifies against the embedded issuer key | `CertificateInvalid` |
//! | Issuer equals the configured trusted root (if any) | `CertificateInvalid` |
//! | `not_before <= now <= not_after` | `CertificateInvalid` |
//! | Claim covers the requested address | `Unauthorized` |

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared_crypto::{
    Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, X25519KeyPair, X25519PublicKey,
};
use shared_types::{ProtocolError, ProtocolErrorCode, ServiceAddress};
use std::fmt;
use std::time::Duration;
use zeroize::{Zeroize, Zeroizing};

/// Length of the per-server session secret.
pub const SECRET_LEN: usize = 32;

fn invalid(message: impl Into<String>) -> ProtocolError {
    ProtocolError::new(ProtocolErrorCode::CertificateInvalid, message)
}

/// Signed portion of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub serial: u64,
    pub subject: String,
    /// Authorized addresses: `ns:key`, `ns:*` or `*`.
    pub authorized_services: Vec<String>,
    /// Key-request sealing key.
    pub encryption_key: [u8; 32],
    pub not_before: u64,
    pub not_after: u64,
    /// Ed25519 key of the issuer.
    pub issuer: [u8; 32],
}

/// A signed certificate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCertificate {
    body: CertificateBody,
    signature: Vec<u8>,
}

impl ServiceCertificate {
    #[must_use]
    pub fn body(&self) -> &CertificateBody {
        &self.body
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.body.subject
    }

    #[must_use]
    pub fn encryption_key(&self) -> X25519PublicKey {
        X25519PublicKey::from_bytes(self.body.encryption_key)
    }

    /// Whether the claim covers `address`.
    #[must_use]
    pub fn authorizes(&self, address: &ServiceAddress) -> bool {
        self.body.authorized_services.iter().any(|claim| {
            if claim == "*" {
                return true;
            }
            match claim.split_once(':') {
                Some((ns, "*")) => ns == address.namespace(),
                Some((ns, key)) => ns == address.namespace() && key == address.key(),
                None => false,
            }
        })
    }

    /// Verify signature, validity window and (optionally) the issuing root.
    ///
    /// # Errors
    ///
    /// `CertificateInvalid` describing the first failed check.
    pub fn verify(
        &self,
        trusted_root: Option<&Ed25519PublicKey>,
        now_secs: u64,
    ) -> Result<(), ProtocolError> {
        let issuer = Ed25519PublicKey::from_bytes(self.body.issuer)
            .map_err(|_| invalid("malformed issuer key"))?;
        if let Some(root) = trusted_root {
            if root != &issuer {
                return Err(invalid("issuer is not the trusted root"));
            }
        }

        let signature =
            Ed25519Signature::from_slice(&self.signature).map_err(|_| invalid("malformed signature"))?;
        let signed = encode_body(&self.body)?;
        issuer
            .verify(&signed, &signature)
            .map_err(|_| invalid("signature does not verify"))?;

        if now_secs < self.body.not_before || now_secs > self.body.not_after {
            return Err(invalid("certificate is outside its validity period"));
        }
        Ok(())
    }

    /// Verify and check the claim for `address`.
    ///
    /// # Errors
    ///
    /// `CertificateInvalid` or `Unauthorized`.
    pub fn validate_for(
        &self,
        address: &ServiceAddress,
        trusted_root: Option<&Ed25519PublicKey>,
        now_secs: u64,
    ) -> Result<(), ProtocolError> {
        self.verify(trusted_root, now_secs)?;
        if !self.authorizes(address) {
            return Err(ProtocolError::new(
                ProtocolErrorCode::Unauthorized,
                format!("certificate '{}' does not cover {}", self.body.subject, address),
            ));
        }
        Ok(())
    }

    /// Wire encoding.
    ///
    /// # Errors
    ///
    /// `BadPayload` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self)
            .map_err(|e| ProtocolError::new(ProtocolErrorCode::BadPayload, e.to_string()))
    }

    /// # Errors
    ///
    /// `CertificateInvalid` for undecodable bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|_| invalid("undecodable certificate"))
    }
}

impl fmt::Debug for ServiceCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCertificate")
            .field("serial", &self.body.serial)
            .field("subject", &self.body.subject)
            .field("authorized_services", &self.body.authorized_services)
            .finish_non_exhaustive()
    }
}

fn encode_body(body: &CertificateBody) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(body).map_err(|e| invalid(e.to_string()))
}

// =============================================================================
// AUTHORITY
// =============================================================================

/// Issues certificates.
pub struct CertificateAuthority {
    signing_key: Ed25519KeyPair,
}

impl CertificateAuthority {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: Ed25519KeyPair::generate(),
        }
    }

    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: Ed25519KeyPair::from_seed(seed),
        }
    }

    /// Root key clients should trust.
    #[must_use]
    pub fn public_key(&self) -> Ed25519PublicKey {
        self.signing_key.public_key()
    }

    /// Issue a certificate valid from `now_secs` for `validity`.
    ///
    /// # Errors
    ///
    /// Fails only if the body cannot be encoded.
    pub fn issue(
        &self,
        subject: impl Into<String>,
        authorized_services: Vec<String>,
        encryption_key: &X25519PublicKey,
        now_secs: u64,
        validity: Duration,
    ) -> Result<ServiceCertificate, ProtocolError> {
        let body = CertificateBody {
            serial: OsRng.next_u64(),
            subject: subject.into(),
            authorized_services,
            encryption_key: *encryption_key.as_bytes(),
            not_before: now_secs,
            not_after: now_secs.saturating_add(validity.as_secs()),
            issuer: *self.public_key().as_bytes(),
        };
        let signature = self.signing_key.sign(&encode_body(&body)?);
        Ok(ServiceCertificate {
            body,
            signature: signature.as_bytes().to_vec(),
        })
    }

    /// Issue a certificate together with fresh server key material.
    ///
    /// # Errors
    ///
    /// Fails only if the body cannot be encoded.
    pub fn issue_identity(
        &self,
        subject: impl Into<String>,
        authorized_services: Vec<String>,
        now_secs: u64,
        validity: Duration,
    ) -> Result<ServerIdentity, ProtocolError> {
        let keys = X25519KeyPair::generate();
        let certificate = self.issue(
            subject,
            authorized_services,
            &keys.public_key(),
            now_secs,
            validity,
        )?;
        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        let identity = ServerIdentity::new(certificate, keys, secret.to_vec());
        secret.zeroize();
        Ok(identity)
    }
}

// =============================================================================
// SERVER IDENTITY
// =============================================================================

/// Everything a secure service needs: its certificate, the matching private
/// key, and the secret session keys are derived from.
pub struct ServerIdentity {
    certificate: ServiceCertificate,
    keys: X25519KeyPair,
    secret: Zeroizing<Vec<u8>>,
}

impl ServerIdentity {
    #[must_use]
    pub fn new(certificate: ServiceCertificate, keys: X25519KeyPair, secret: Vec<u8>) -> Self {
        Self {
            certificate,
            keys,
            secret: Zeroizing::new(secret),
        }
    }

    #[must_use]
    pub fn certificate(&self) -> &ServiceCertificate {
        &self.certificate
    }

    pub(crate) fn keys(&self) -> &X25519KeyPair {
        &self.keys
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}
