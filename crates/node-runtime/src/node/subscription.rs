//! Event subscriptions as channels.

use super::Node;
use futures::Stream;
use shared_types::{Envelope, ServiceAddress};
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Unsubscribes from the node exactly once.
struct SubscriptionGuard {
    id: u64,
    node: Weak<Node>,
    released: bool,
}

impl SubscriptionGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(node) = self.node.upgrade() {
            node.unsubscribe(self.id);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Events matching a pattern, in arrival order.
///
/// Dropping the subscription unsubscribes.
pub struct EventSubscription {
    pattern: ServiceAddress,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    guard: SubscriptionGuard,
}

impl EventSubscription {
    pub(crate) fn new(
        id: u64,
        pattern: ServiceAddress,
        receiver: mpsc::UnboundedReceiver<Envelope>,
        node: Weak<Node>,
    ) -> Self {
        Self {
            pattern,
            receiver,
            guard: SubscriptionGuard {
                id,
                node,
                released: false,
            },
        }
    }

    #[must_use]
    pub fn pattern(&self) -> &ServiceAddress {
        &self.pattern
    }

    /// Next event. `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Next buffered event, if any.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving new events. Already buffered events can still be
    /// read.
    pub fn close(&mut self) {
        self.guard.release();
        self.receiver.close();
    }

    /// Consume the subscription as a [`Stream`].
    #[must_use]
    pub fn into_stream(self) -> EventStream {
        let Self {
            receiver, guard, ..
        } = self;
        EventStream {
            inner: UnboundedReceiverStream::new(receiver),
            _guard: guard,
        }
    }
}

/// Stream form of an [`EventSubscription`].
pub struct EventStream {
    inner: UnboundedReceiverStream<Envelope>,
    _guard: SubscriptionGuard,
}

impl Stream for EventStream {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
