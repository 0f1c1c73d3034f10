//! Secure protocol payloads and their wire encoding.
//!
//! | Message | Body |
//! |---------|------|
//! | `RequestCertificate` | empty |
//! | `RespondCertificate` | [`ServiceCertificate`](crate::ServiceCertificate) |
//! | `RequestKey` | [`KeyRequest`] sealed to the certificate key |
//! | `RespondKey` | [`KeyResponse`] under the client's handshake key |
//! | `RequestMessage` / `RespondMessage` | [`SecureMessage`] sealing a [`SealedFrame`] |
//! | `Error` | [`ErrorMessage`] |
//!
//! All bodies are bincode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared_crypto::{
    decrypt, encrypt, open_sealed, seal, CryptoError, Iv, SealedBox, SymmetricKey, X25519KeyPair,
    X25519PublicKey, IV_LEN, KEY_LEN,
};
use shared_types::{
    Headers, MessagingError, ProtocolError, ProtocolErrorCode, SecureHeader, SecureMessageType,
    SECURE_HEADER,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Associated data bound into every key response.
const KEY_RESPONSE_AAD: &[u8] = b"meshbus-key-response-v1";

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(value)
        .map_err(|e| ProtocolError::new(ProtocolErrorCode::BadPayload, e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes)
        .map_err(|e| ProtocolError::new(ProtocolErrorCode::BadPayload, e.to_string()))
}

/// Map a crypto failure onto the wire code for the step that failed.
pub(crate) fn crypto_failure(code: ProtocolErrorCode, err: CryptoError) -> ProtocolError {
    ProtocolError::new(code, err.to_string())
}

/// Headers carrying only the secure header for `message_type`.
#[must_use]
pub fn secure_headers(message_type: SecureMessageType) -> Headers {
    let mut headers = Headers::new();
    headers.insert(
        SECURE_HEADER.to_string(),
        SecureHeader::new(message_type).to_string(),
    );
    headers
}

// =============================================================================
// KEY EXCHANGE
// =============================================================================

#[derive(Serialize, Deserialize)]
struct SealedPayload {
    ephemeral_public: [u8; 32],
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

/// Client's one-time handshake key and IV.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyRequest {
    pub handshake_key: [u8; KEY_LEN],
    pub handshake_iv: [u8; IV_LEN],
}

impl KeyRequest {
    /// Fresh random handshake material.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            handshake_key: *SymmetricKey::generate().as_bytes(),
            handshake_iv: *Iv::generate().as_bytes(),
        }
    }

    #[must_use]
    pub fn key(&self) -> SymmetricKey {
        SymmetricKey::from_bytes(self.handshake_key)
    }

    #[must_use]
    pub fn iv(&self) -> Iv {
        Iv::from_bytes(self.handshake_iv)
    }

    /// Seal to the server's certificate key.
    ///
    /// # Errors
    ///
    /// `KeyExchangeFailed` if sealing fails.
    pub fn seal(&self, recipient: &X25519PublicKey) -> Result<Vec<u8>, ProtocolError> {
        let plaintext = zeroize::Zeroizing::new(encode(self)?);
        let sealed = seal(recipient, &plaintext)
            .map_err(|e| crypto_failure(ProtocolErrorCode::KeyExchangeFailed, e))?;
        encode(&SealedPayload {
            ephemeral_public: sealed.ephemeral_public,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        })
    }

    /// Open a sealed request with the server's private key.
    ///
    /// # Errors
    ///
    /// `KeyExchangeFailed` for anything that does not open.
    pub fn open(bytes: &[u8], keys: &X25519KeyPair) -> Result<Self, ProtocolError> {
        let failed = |message: &str| ProtocolError::new(ProtocolErrorCode::KeyExchangeFailed, message);
        let payload: SealedPayload = decode(bytes).map_err(|_| failed("malformed key request"))?;
        let sealed = SealedBox {
            ephemeral_public: payload.ephemeral_public,
            nonce: payload.nonce,
            ciphertext: payload.ciphertext,
        };
        let plaintext = zeroize::Zeroizing::new(
            open_sealed(keys, &sealed).map_err(|_| failed("key request does not open"))?,
        );
        decode(&plaintext).map_err(|_| failed("malformed key request"))
    }
}

/// Server's answer: the session nonce, key and slot.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyResponse {
    pub nonce: [u8; 16],
    pub key: [u8; KEY_LEN],
    pub time_slot: u64,
}

impl KeyResponse {
    /// Encrypt under the client's handshake key.
    ///
    /// # Errors
    ///
    /// `KeyExchangeFailed` if encryption fails.
    pub fn encrypt(&self, request: &KeyRequest) -> Result<Vec<u8>, ProtocolError> {
        let plaintext = zeroize::Zeroizing::new(encode(self)?);
        encrypt(&request.key(), &request.iv(), KEY_RESPONSE_AAD, &plaintext)
            .map_err(|e| crypto_failure(ProtocolErrorCode::KeyExchangeFailed, e))
    }

    /// # Errors
    ///
    /// `KeyExchangeFailed` if the response does not decrypt or decode.
    pub fn decrypt(bytes: &[u8], request: &KeyRequest) -> Result<Self, ProtocolError> {
        let plaintext = zeroize::Zeroizing::new(
            decrypt(&request.key(), &request.iv(), KEY_RESPONSE_AAD, bytes)
                .map_err(|e| crypto_failure(ProtocolErrorCode::KeyExchangeFailed, e))?,
        );
        decode(&plaintext).map_err(|e| ProtocolError::new(ProtocolErrorCode::KeyExchangeFailed, e.message))
    }
}

// =============================================================================
// APPLICATION MESSAGES
// =============================================================================

/// An encrypted request or response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureMessage {
    pub time_slot: u64,
    pub nonce: [u8; 16],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl SecureMessage {
    /// # Errors
    ///
    /// `BadPayload` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// # Errors
    ///
    /// `BadPayload` for undecodable bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Plaintext sealed inside a [`SecureMessage`]. Application headers such as
/// `x-rpc` and `x-error` travel here, never on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SealedFrame {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SealedFrame {
    #[must_use]
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }
}

/// Body of an `Error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

impl From<&ProtocolError> for ErrorMessage {
    fn from(err: &ProtocolError) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
        }
    }
}

impl ErrorMessage {
    /// Back to a typed error. Unknown codes become `BadPayload`.
    #[must_use]
    pub fn into_error(self) -> MessagingError {
        let code = self.code.parse().unwrap_or(ProtocolErrorCode::BadPayload);
        MessagingError::Protocol(ProtocolError::new(code, self.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_request_seal_open() {
        let server = X25519KeyPair::from_seed([4; 32]);
        let request = KeyRequest::generate();
        let bytes = request.seal(&server.public_key()).unwrap();

        let opened = KeyRequest::open(&bytes, &server).unwrap();
        assert_eq!(opened.handshake_key, request.handshake_key);
        assert_eq!(opened.handshake_iv, request.handshake_iv);

        let stranger = X25519KeyPair::from_seed([5; 32]);
        let err = KeyRequest::open(&bytes, &stranger).err().unwrap();
        assert_eq!(err.code, ProtocolErrorCode::KeyExchangeFailed);
    }

    #[test]
    fn test_key_response_bound_to_handshake_key() {
        let request = KeyRequest::generate();
        let response = KeyResponse {
            nonce: [7; 16],
            key: [8; KEY_LEN],
            time_slot: 944_000,
        };
        let bytes = response.encrypt(&request).unwrap();
        let decrypted = KeyResponse::decrypt(&bytes, &request).unwrap();
        assert_eq!(decrypted.nonce, [7; 16]);
        assert_eq!(decrypted.time_slot, 944_000);

        let other = KeyRequest::generate();
        assert!(KeyResponse::decrypt(&bytes, &other).is_err());
    }

    #[test]
    fn test_error_message_round_trip() {
        let err = ProtocolError::new(ProtocolErrorCode::TimeSlotExpired, "slot#4 expired");
        let message = ErrorMessage::from(&err);
        assert_eq!(message.code, "TimeSlotExpired");
        assert_eq!(message.into_error(), MessagingError::Protocol(err));

        let unknown = ErrorMessage {
            code: "Mystery".into(),
            message: String::new(),
        };
        match unknown.into_error() {
            MessagingError::Protocol(p) => assert_eq!(p.code, ProtocolErrorCode::BadPayload),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_secure_headers() {
        let headers = secure_headers(SecureMessageType::RequestKey);
        assert_eq!(
            headers.get(SECURE_HEADER).map(String::as_str),
            Some("v=1;t=requestkey")
        );
    }
}
