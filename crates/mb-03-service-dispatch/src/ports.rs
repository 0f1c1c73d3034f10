//! Ports for the Service Dispatch subsystem.
//!
//! Inbound: the behavior and filters that application code binds to a
//! service. Outbound: the acknowledgment path back to the broker.

use async_trait::async_trait;
use mb_01_serial_executor::SerialExecutor;
use shared_bus::BrokerChannel;
use shared_types::{Envelope, MessagingError};
use std::future::Future;
use std::sync::Arc;

/// Application code bound to a service address.
///
/// The envelope is the explicit per-call context: it carries the headers,
/// the correlation id and the reply capability.
#[async_trait]
pub trait ServiceBehavior: Send + Sync {
    /// Handle one message. An `Err` (or a panic) counts as a fault; the
    /// message is still acknowledged.
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// What a filter wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Pass the message to the next filter (or the behavior).
    Continue,
    /// The filter fully handled the message; stop processing it.
    Stop,
}

/// A stage in a service's ordered filter chain.
#[async_trait]
pub trait ServiceFilter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Inspect or rewrite the envelope.
    ///
    /// # Errors
    ///
    /// An error ends processing for the message and counts as a fault.
    async fn handle(&self, envelope: &mut Envelope) -> Result<FilterDecision, MessagingError>;
}

/// Acknowledges deliveries to the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;
}

/// Acks through the channel's serial executor.
pub struct ExecutorAcknowledger {
    executor: Arc<SerialExecutor>,
    channel: Arc<dyn BrokerChannel>,
}

impl ExecutorAcknowledger {
    pub fn new(executor: Arc<SerialExecutor>, channel: Arc<dyn BrokerChannel>) -> Self {
        Self { executor, channel }
    }
}

#[async_trait]
impl Acknowledger for ExecutorAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let channel = self.channel.clone();
        self.executor
            .enqueue_and_await(move || channel.ack(delivery_tag).map_err(MessagingError::from))
            .await
    }
}

/// Behavior built from an async closure.
pub struct FnBehavior<F>(F);

impl<F> FnBehavior<F> {
    pub fn new<Fut>(handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(handler)
    }
}

#[async_trait]
impl<F, Fut> ServiceBehavior for FnBehavior<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self.0)(envelope).await
    }
}
