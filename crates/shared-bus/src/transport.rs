//! # Broker Transport Ports
//!
//! The command/event interface the messaging core consumes. A broker client
//! library (or [`crate::InMemoryBroker`]) implements these traits.

use crate::subscriber::Consumer;
use shared_types::{ConfigurationError, CorrelationId, DeliveryInfo, Envelope, Headers, MessagingError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by broker commands.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The channel has been closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The broker cannot be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// Another consumer holds exclusive access to the queue.
    #[error("queue '{queue}' already has an exclusive consumer")]
    ExclusiveConsumer { queue: String },

    /// The queue is exclusive to another channel.
    #[error("queue '{0}' is locked by another channel")]
    ResourceLocked(String),

    /// Redeclaration with different properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unknown consumer tag '{0}'")]
    UnknownConsumer(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
}

impl From<BrokerError> for MessagingError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ChannelClosed => MessagingError::ConnectionLost(err.to_string()),
            BrokerError::Unavailable(_) => MessagingError::ConnectionLost(err.to_string()),
            BrokerError::ExclusiveConsumer { queue } => {
                MessagingError::Configuration(ConfigurationError::DuplicateSingleton(queue))
            }
            other => MessagingError::Broker(other.to_string()),
        }
    }
}

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Binding key is a `*`/`#` pattern over dot-separated words.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
}

/// Queue declaration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Empty asks the broker to generate a name.
    pub name: String,
    pub durable: bool,
    /// Owned by the declaring channel and deleted when it closes.
    pub exclusive: bool,
    /// Deleted when its last consumer is cancelled.
    pub auto_delete: bool,
    /// Idle expiry.
    pub expires: Option<Duration>,
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Native message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    /// [`CorrelationId::NONE`] when absent.
    pub correlation_id: CorrelationId,
    pub reply_to: Option<String>,
    pub headers: Headers,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Convert into an [`Envelope`] without a reply sink.
    pub fn into_envelope(self) -> Envelope {
        let mut envelope = Envelope::new(self.body)
            .with_correlation_id(self.properties.correlation_id)
            .with_delivery(DeliveryInfo {
                delivery_tag: self.delivery_tag,
                redelivered: self.redelivered,
                exchange: self.exchange,
                routing_key: self.routing_key,
            });
        envelope.message_id = self.properties.message_id;
        envelope.reply_to = self.properties.reply_to;
        envelope.headers = self.properties.headers;
        envelope
    }
}

/// A mandatory message the broker could not route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Asynchronous notifications about a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A mandatory publish was unroutable.
    Returned(ReturnedMessage),
    /// The channel closed. No further events follow.
    Shutdown { reason: String },
}

/// Commands against one broker channel.
///
/// Implementations are not required to tolerate concurrent callers.
pub trait BrokerChannel: Send + Sync {
    /// Broker-assigned channel number.
    fn id(&self) -> u64;

    fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a queue and return its (possibly generated) name.
    fn declare_queue(&self, options: QueueOptions) -> Result<String, BrokerError>;

    fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Start consuming. With `no_ack` the broker forgets a message once
    /// delivered.
    fn consume(&self, queue: &str, exclusive: bool, no_ack: bool) -> Result<Consumer, BrokerError>;

    fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// A connection that produces channels.
pub trait BrokerConnection: Send + Sync {
    /// Open a channel together with its event stream.
    fn create_channel(
        &self,
    ) -> Result<(Arc<dyn BrokerChannel>, mpsc::UnboundedReceiver<ChannelEvent>), BrokerError>;
}
