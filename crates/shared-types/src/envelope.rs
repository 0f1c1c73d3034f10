//! # Envelope
//!
//! An inbound message plus the metadata derived from its delivery. Handlers
//! receive the envelope explicitly; replying goes through the
//! [`ReplySink`] capability carried inside it.
//!
//! ```text
//! broker delivery ──► Envelope { correlation_id, reply_to, headers, body, delivery }
//!                                     │
//!                        reply_sink ──┴──► publish(reply_to, correlation_id, ...)
//! ```
//!
//! The body is the only field that changes after creation (secure-channel
//! decryption replaces it in place).

use crate::correlation::CorrelationId;
use crate::errors::MessagingError;
use crate::headers::ERROR_HEADER;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Message headers. Ordered for stable logging.
pub type Headers = BTreeMap<String, String>;

/// Broker-level delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Tag used to acknowledge the delivery on its channel.
    pub delivery_tag: u64,
    /// True if the broker delivered this message before.
    pub redelivered: bool,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
}

/// Capability to send a reply back to the originator of a message.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Publish `body` to `reply_to` carrying `correlation_id`.
    async fn reply(
        &self,
        reply_to: &str,
        correlation_id: CorrelationId,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<(), MessagingError>;
}

/// An inbound message.
#[derive(Clone, Default)]
pub struct Envelope {
    /// Broker message id, if the publisher set one.
    pub message_id: Option<String>,
    /// Correlation id; [`CorrelationId::NONE`] when no reply is expected.
    pub correlation_id: CorrelationId,
    /// Reply address (queue name on the default exchange).
    pub reply_to: Option<String>,
    /// Application and protocol headers.
    pub headers: Headers,
    /// Raw payload.
    pub body: Vec<u8>,
    /// Present for messages that came from a broker consumer.
    pub delivery: Option<DeliveryInfo>,
    reply_sink: Option<Arc<dyn ReplySink>>,
}

impl Envelope {
    /// Build an envelope around a body with no metadata.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Builder-style correlation id setter.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Builder-style reply-to setter.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Builder-style header setter.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder-style delivery info setter.
    pub fn with_delivery(mut self, delivery: DeliveryInfo) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Attach the reply capability.
    pub fn with_reply_sink(mut self, sink: Arc<dyn ReplySink>) -> Self {
        self.reply_sink = Some(sink);
        self
    }

    /// Header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Replace the payload. Used after decryption.
    pub fn replace_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// True if the sender is waiting for a reply and we can send one.
    pub fn can_reply(&self) -> bool {
        self.reply_to.is_some() && !self.correlation_id.is_none() && self.reply_sink.is_some()
    }

    /// Current reply sink, if any.
    pub fn reply_sink(&self) -> Option<Arc<dyn ReplySink>> {
        self.reply_sink.clone()
    }

    /// Replace the reply sink with `wrap(current)`.
    ///
    /// No-op when the envelope has no sink.
    pub fn wrap_reply_sink<F>(&mut self, wrap: F)
    where
        F: FnOnce(Arc<dyn ReplySink>) -> Arc<dyn ReplySink>,
    {
        if let Some(inner) = self.reply_sink.take() {
            self.reply_sink = Some(wrap(inner));
        }
    }

    /// Send a reply to the originator.
    pub async fn reply(&self, body: Vec<u8>, headers: Headers) -> Result<(), MessagingError> {
        let (reply_to, sink) = match (&self.reply_to, &self.reply_sink) {
            (Some(reply_to), Some(sink)) if !self.correlation_id.is_none() => (reply_to, sink),
            _ => {
                return Err(MessagingError::Dispatch(
                    "message does not expect a reply".to_string(),
                ))
            }
        };
        sink.reply(reply_to, self.correlation_id, headers, body).await
    }

    /// Reply with an application error the caller sees as
    /// [`MessagingError::Remote`].
    pub async fn reply_error(&self, code: &str, message: &str) -> Result<(), MessagingError> {
        let mut headers = Headers::new();
        headers.insert(ERROR_HEADER.to_string(), format!("{};{}", code, message));
        self.reply(Vec::new(), headers).await
    }

    /// Decode an `x-error` header into a remote error.
    pub fn remote_error(&self) -> Option<MessagingError> {
        let value = self.header(ERROR_HEADER)?;
        let (code, message) = value.split_once(';').unwrap_or((value, ""));
        Some(MessagingError::remote(code, message))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message_id", &self.message_id)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("delivery", &self.delivery)
            .field("has_reply_sink", &self.reply_sink.is_some())
            .finish()
    }
}
