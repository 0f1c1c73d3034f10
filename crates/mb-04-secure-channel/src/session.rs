//! Session keys and per-address handshake state.

use crate::certificate::ServiceCertificate;
use crate::messages::{crypto_failure, decode, encode, SealedFrame, SecureMessage};
use crate::timeslot::TimeSlot;
use parking_lot::RwLock;
use shared_crypto::{decrypt, derive_session_key, encrypt, Iv, SymmetricKey};
use shared_types::{Headers, ProtocolError, ProtocolErrorCode, ServiceAddress};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A symmetric key valid for one time slot.
///
/// Each sealed message uses a fresh random IV; the session nonce is bound as
/// associated data.
#[derive(Clone)]
pub struct SessionKey {
    key: SymmetricKey,
    nonce: [u8; 16],
    time_slot: TimeSlot,
}

impl SessionKey {
    #[must_use]
    pub fn new(key: SymmetricKey, nonce: [u8; 16], time_slot: TimeSlot) -> Self {
        Self {
            key,
            nonce,
            time_slot,
        }
    }

    /// Recompute the key the server handed out for `(nonce, time_slot)`.
    ///
    /// # Errors
    ///
    /// `KeyExchangeFailed` if the secret is unusable.
    pub fn derive(secret: &[u8], nonce: [u8; 16], time_slot: TimeSlot) -> Result<Self, ProtocolError> {
        let key = derive_session_key(secret, &nonce, time_slot.index())
            .map_err(|e| crypto_failure(ProtocolErrorCode::KeyExchangeFailed, e))?;
        Ok(Self::new(key, nonce, time_slot))
    }

    #[must_use]
    pub fn nonce(&self) -> &[u8; 16] {
        &self.nonce
    }

    #[must_use]
    pub fn time_slot(&self) -> TimeSlot {
        self.time_slot
    }

    pub(crate) fn key_bytes(&self) -> &[u8; 16] {
        self.key.as_bytes()
    }

    /// Encrypt a payload.
    ///
    /// # Errors
    ///
    /// `BadPayload` if the cipher refuses the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SecureMessage, ProtocolError> {
        let iv = Iv::generate();
        let ciphertext = encrypt(&self.key, &iv, &self.nonce, plaintext)
            .map_err(|e| crypto_failure(ProtocolErrorCode::BadPayload, e))?;
        Ok(SecureMessage {
            time_slot: self.time_slot.index(),
            nonce: self.nonce,
            iv: *iv.as_bytes(),
            ciphertext,
        })
    }

    /// Decrypt a payload sealed under this key.
    ///
    /// # Errors
    ///
    /// `DecryptionFailed` if the message names another session or does not
    /// authenticate.
    pub fn open(&self, message: &SecureMessage) -> Result<Vec<u8>, ProtocolError> {
        if message.nonce != self.nonce || message.time_slot != self.time_slot.index() {
            return Err(ProtocolError::new(
                ProtocolErrorCode::DecryptionFailed,
                "message belongs to a different session",
            ));
        }
        decrypt(&self.key, &Iv::from_bytes(message.iv), &self.nonce, &message.ciphertext)
            .map_err(|e| crypto_failure(ProtocolErrorCode::DecryptionFailed, e))
    }

    /// Seal application headers together with the body.
    ///
    /// # Errors
    ///
    /// `BadPayload` if the frame cannot be encoded or encrypted.
    pub fn seal_frame(&self, headers: &Headers, body: &[u8]) -> Result<SecureMessage, ProtocolError> {
        let frame = SealedFrame::new(headers.clone(), body.to_vec());
        let plaintext = zeroize::Zeroizing::new(encode(&frame)?);
        self.seal(&plaintext)
    }

    /// Open a message sealed with [`seal_frame`](Self::seal_frame).
    ///
    /// # Errors
    ///
    /// `DecryptionFailed` as [`open`](Self::open), `BadPayload` if the
    /// plaintext is not a frame.
    pub fn open_frame(&self, message: &SecureMessage) -> Result<SealedFrame, ProtocolError> {
        let plaintext = zeroize::Zeroizing::new(self.open(message)?);
        decode(&plaintext)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("time_slot", &self.time_slot)
            .finish_non_exhaustive()
    }
}

/// Client-side state for one service address.
///
/// The handshake lock serializes handshakes so concurrent callers share one.
/// The cached certificate and key are read without it.
///
/// The per-attempt handshake key and IV are not stored here. They live in a
/// [`KeyRequest`](crate::messages::KeyRequest) local to one key exchange and
/// are zeroized when that attempt ends.
pub struct HandshakeSession {
    address: ServiceAddress,
    handshake: Mutex<()>,
    certificate: RwLock<Option<Arc<ServiceCertificate>>>,
    key: RwLock<Option<Arc<SessionKey>>>,
    key_exchanges: AtomicU64,
}

impl HandshakeSession {
    #[must_use]
    pub fn new(address: ServiceAddress) -> Self {
        Self {
            address,
            handshake: Mutex::new(()),
            certificate: RwLock::new(None),
            key: RwLock::new(None),
            key_exchanges: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    pub(crate) fn handshake_lock(&self) -> &Mutex<()> {
        &self.handshake
    }

    /// Active key, unless it is inside its renewal window.
    #[must_use]
    pub fn current_key(&self, now_secs: u64) -> Option<Arc<SessionKey>> {
        self.key
            .read()
            .as_ref()
            .filter(|key| !key.time_slot().needs_renewal(now_secs))
            .cloned()
    }

    #[must_use]
    pub fn certificate(&self) -> Option<Arc<ServiceCertificate>> {
        self.certificate.read().clone()
    }

    pub(crate) fn set_certificate(&self, certificate: Arc<ServiceCertificate>) {
        *self.certificate.write() = Some(certificate);
    }

    pub(crate) fn set_key(&self, key: Arc<SessionKey>) {
        *self.key.write() = Some(key);
        self.key_exchanges.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop the active key so the next call re-handshakes.
    pub fn invalidate_key(&self) {
        self.key.write().take();
    }

    /// Drop the cached certificate and key.
    pub fn reset(&self) {
        self.certificate.write().take();
        self.invalidate_key();
    }

    /// Completed key exchanges.
    #[must_use]
    pub fn key_exchanges(&self) -> u64 {
        self.key_exchanges.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("address", &self.address)
            .field("key", &*self.key.read())
            .field("key_exchanges", &self.key_exchanges())
            .finish_non_exhaustive()
    }
}
