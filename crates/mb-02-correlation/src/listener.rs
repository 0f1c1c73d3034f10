//! Reply listener - routes deliveries from the reply queue to waiters.

use crate::registry::CorrelationRegistry;
use shared_bus::Consumer;
use shared_types::{CorrelationId, Envelope};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Why a reply could not be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnroutableReason {
    /// The delivery carried no correlation id.
    MissingCorrelationId,
    /// No waiter is registered (late reply, or never registered).
    NoWaiter,
}

/// Events published by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    UnroutableReply {
        correlation_id: Option<CorrelationId>,
        reason: UnroutableReason,
    },
}

const EVENT_CAPACITY: usize = 256;

/// Feeds the node's reply queue into a [`CorrelationRegistry`].
pub struct ReplyListener {
    registry: CorrelationRegistry,
    events: broadcast::Sender<ListenerEvent>,
}

impl ReplyListener {
    #[must_use]
    pub fn new(registry: CorrelationRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { registry, events }
    }

    /// Subscribe to unroutable-reply notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    /// Route one reply. Returns true if a waiter took it.
    pub fn handle(&self, envelope: Envelope) -> bool {
        let id = envelope.correlation_id;
        if id.is_none() {
            warn!("Dropping reply without correlation id");
            let _ = self.events.send(ListenerEvent::UnroutableReply {
                correlation_id: None,
                reason: UnroutableReason::MissingCorrelationId,
            });
            return false;
        }

        if self.registry.resolve(id, envelope) {
            return true;
        }

        warn!(correlation_id = %id, "Dropping reply with no waiter");
        let _ = self.events.send(ListenerEvent::UnroutableReply {
            correlation_id: Some(id),
            reason: UnroutableReason::NoWaiter,
        });
        false
    }

    /// Drain `consumer` until it ends.
    ///
    /// The reply queue is consumed with `no_ack`, so nothing is acknowledged
    /// here.
    pub async fn run(&self, mut consumer: Consumer) {
        debug!(queue = consumer.queue(), "Reply listener started");
        while let Some(delivery) = consumer.recv().await {
            self.handle(delivery.into_envelope());
        }
        debug!(queue = consumer.queue(), "Reply listener stopped");
    }
}
