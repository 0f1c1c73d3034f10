//! Server side of the secure channel: a service filter.
//!
//! Handshake messages are answered by the filter itself and never reach the
//! behavior. `RequestMessage` bodies are decrypted in place and the reply
//! sink is wrapped so the behavior's reply goes back encrypted under the same
//! session key. Every failure is answered with an `Error` message carrying a
//! machine-readable code.

use crate::certificate::ServerIdentity;
use crate::messages::{
    secure_headers, ErrorMessage, KeyRequest, KeyResponse, SealedFrame, SecureMessage,
};
use crate::session::SessionKey;
use crate::timeslot::{Clock, SystemClock, TimeSlot};
use async_trait::async_trait;
use mb_03_service_dispatch::{FilterDecision, ServiceFilter};
use rand::rngs::OsRng;
use rand::RngCore;
use shared_types::{
    CorrelationId, Envelope, Headers, MessagingError, ProtocolError, ProtocolErrorCode,
    ReplySink, SecureHeader, SecureMessageType, SECURE_HEADER,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Filter that terminates the secure protocol for one service.
pub struct SecureServiceFilter {
    identity: Arc<ServerIdentity>,
    clock: Arc<dyn Clock>,
}

impl SecureServiceFilter {
    pub fn new(identity: Arc<ServerIdentity>) -> Self {
        Self::with_clock(identity, Arc::new(SystemClock))
    }

    pub fn with_clock(identity: Arc<ServerIdentity>, clock: Arc<dyn Clock>) -> Self {
        Self { identity, clock }
    }

    async fn respond(&self, envelope: &Envelope, message_type: SecureMessageType, body: Vec<u8>) {
        if !envelope.can_reply() {
            warn!(
                correlation_id = %envelope.correlation_id,
                message_type = message_type.as_str(),
                "Secure message has no reply address; dropping response"
            );
            return;
        }
        if let Err(e) = envelope.reply(body, secure_headers(message_type)).await {
            warn!(correlation_id = %envelope.correlation_id, error = %e, "Failed to send secure response");
        }
    }

    async fn reject(&self, envelope: &Envelope, error: ProtocolError) {
        debug!(
            correlation_id = %envelope.correlation_id,
            code = %error.code,
            message = %error.message,
            "Rejecting secure message"
        );
        match crate::messages::encode(&ErrorMessage::from(&error)) {
            Ok(body) => self.respond(envelope, SecureMessageType::Error, body).await,
            Err(e) => warn!(error = %e, "Failed to encode secure error"),
        }
    }

    fn key_response(&self, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let request = KeyRequest::open(body, self.identity.keys())?;
        let slot = TimeSlot::for_new_key(self.clock.now_secs());
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let session = SessionKey::derive(self.identity.secret(), nonce, slot)?;

        let response = KeyResponse {
            nonce,
            key: *session.key_bytes(),
            time_slot: slot.index(),
        };
        debug!(slot = %slot, "Issued session key");
        response.encrypt(&request)
    }

    fn open_request(&self, body: &[u8]) -> Result<(SessionKey, SealedFrame), ProtocolError> {
        let message = SecureMessage::decode(body)?;
        let slot = TimeSlot::from_index(message.time_slot);
        if !slot.is_acceptable(self.clock.now_secs()) {
            return Err(ProtocolError::new(
                ProtocolErrorCode::TimeSlotExpired,
                format!("{} is not acceptable", slot),
            ));
        }
        let session = SessionKey::derive(self.identity.secret(), message.nonce, slot)?;
        let frame = session.open_frame(&message)?;
        Ok((session, frame))
    }
}

#[async_trait]
impl ServiceFilter for SecureServiceFilter {
    fn name(&self) -> &str {
        "secure-channel"
    }

    async fn handle(&self, envelope: &mut Envelope) -> Result<FilterDecision, MessagingError> {
        let header = match envelope.header(SECURE_HEADER).map(SecureHeader::parse) {
            Some(Ok(header)) => header,
            Some(Err(e)) => {
                self.reject(envelope, e).await;
                return Ok(FilterDecision::Stop);
            }
            None => {
                let error = ProtocolError::new(
                    ProtocolErrorCode::SecureRequired,
                    "service only accepts encrypted requests",
                );
                self.reject(envelope, error).await;
                return Ok(FilterDecision::Stop);
            }
        };

        match header.message_type {
            SecureMessageType::RequestCertificate => {
                match self.identity.certificate().encode() {
                    Ok(body) => {
                        self.respond(envelope, SecureMessageType::RespondCertificate, body)
                            .await
                    }
                    Err(e) => self.reject(envelope, e).await,
                }
                Ok(FilterDecision::Stop)
            }
            SecureMessageType::RequestKey => {
                match self.key_response(&envelope.body) {
                    Ok(body) => self.respond(envelope, SecureMessageType::RespondKey, body).await,
                    Err(e) => self.reject(envelope, e).await,
                }
                Ok(FilterDecision::Stop)
            }
            SecureMessageType::RequestMessage => match self.open_request(&envelope.body) {
                Ok((session, frame)) => {
                    envelope.replace_body(frame.body);
                    envelope.headers.remove(SECURE_HEADER);
                    envelope.headers.extend(frame.headers);
                    let session = Arc::new(session);
                    envelope.wrap_reply_sink(|inner| Arc::new(EncryptingSink { inner, session }));
                    Ok(FilterDecision::Continue)
                }
                Err(e) => {
                    self.reject(envelope, e).await;
                    Ok(FilterDecision::Stop)
                }
            },
            other => {
                let error = ProtocolError::new(
                    ProtocolErrorCode::BadMessageType,
                    format!("{} is not a request", other.as_str()),
                );
                self.reject(envelope, error).await;
                Ok(FilterDecision::Stop)
            }
        }
    }
}

/// Encrypts the behavior's reply under the request's session key. Reply
/// headers are sealed with the body; only the secure header goes out in the
/// clear.
struct EncryptingSink {
    inner: Arc<dyn ReplySink>,
    session: Arc<SessionKey>,
}

#[async_trait]
impl ReplySink for EncryptingSink {
    async fn reply(
        &self,
        reply_to: &str,
        correlation_id: CorrelationId,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<(), MessagingError> {
        let sealed = self.session.seal_frame(&headers, &body)?.encode()?;
        let wire = secure_headers(SecureMessageType::RespondMessage);
        self.inner.reply(reply_to, correlation_id, wire, sealed).await
    }
}
